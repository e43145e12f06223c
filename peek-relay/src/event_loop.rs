use crate::config::RelayConfig;
use crate::{create_socket, handle_client};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::oneshot;
use tracing::{error, field, info, instrument, span, warn, Instrument, Level};

pub struct RelayRunner {
    pub cfg: Arc<RelayConfig>,
    pub shutdown_rx: oneshot::Receiver<()>,
    pub tasks_counter: Arc<AtomicUsize>,
}

impl RelayRunner {
    pub fn new(cfg: RelayConfig) -> (oneshot::Sender<()>, Self) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        (
            shutdown_tx,
            Self {
                cfg: Arc::new(cfg),
                shutdown_rx,
                tasks_counter: Arc::new(AtomicUsize::new(0)),
            },
        )
    }

    #[instrument(level = "info", name = "relay", skip_all, fields(listen_addr = %self.cfg.listen_addr, upstream = %self.cfg.upstream))]
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let tcp_server = create_socket(self.cfg.listen_addr)?;
        tcp_server.listen(4096)?;
        let tcp_server = TcpListener::from_std(std::net::TcpListener::from(tcp_server))?;

        info!("starting");
        let _guard = scopeguard::guard((), |_| {
            info!("stopped");
        });

        loop {
            let (stream, peer_addr) = select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    warn!("Asked to shutdown");
                    break;
                }

                ret = tcp_server.accept() => {
                    match ret {
                        Ok(cnx) => cnx,
                        Err(err) => {
                            // https://stackoverflow.com/questions/76955978/which-socket-accept-errors-are-fatal
                            error!("error accepting new connections: {:?}", err);
                            continue;
                        }
                    }
                }
            };

            let span = span!(
                Level::INFO,
                "cnx",
                peer = %peer_addr,
                peeked = field::Empty,
            );

            let cfg = self.cfg.clone();
            let task_counter = self.tasks_counter.clone();
            let relayed_client_loop = async move {
                task_counter.fetch_add(1, Ordering::Relaxed);
                let _guard = scopeguard::guard((), |_| {
                    task_counter.fetch_sub(1, Ordering::Relaxed);
                });

                if let Err(err) = handle_client(&cfg, stream, peer_addr).await {
                    warn!("{:?}", err);
                }
            }
            .instrument(span);

            tokio::spawn(relayed_client_loop);
        }

        Ok(())
    }
}
