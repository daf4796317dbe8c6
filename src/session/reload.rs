// Per-session reload subscriber.
//
// Reload arrives as broadcast messages, each a pure state update against
// the session's atomics. Nothing here calls into the protocol, and a
// removed vhost never closes the socket: the fd belongs to the driver
// task, which notices `expired` at its next suspension point.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{trace, warn, Instrument};

use crate::config::{ConfigStore, ReloadEvent};
use crate::net::SocketTuner;
use crate::session::state::SessionState;

pub struct ReloadSubscriber {
    handle: JoinHandle<()>,
}

impl ReloadSubscriber {
    pub fn spawn(
        config: Arc<ConfigStore>,
        state: Arc<SessionState>,
        tuner: Arc<SocketTuner>,
    ) -> Self {
        let mut rx = config.subscribe();
        let handle = tokio::spawn(
            async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => apply(&config, &state, &tuner, event),
                        Err(RecvError::Lagged(n)) => {
                            warn!("reload subscriber lagged, {n} events missed");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .in_current_span(),
        );
        Self { handle }
    }
}

impl Drop for ReloadSubscriber {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn apply(
    config: &ConfigStore,
    state: &SessionState,
    tuner: &SocketTuner,
    event: ReloadEvent,
) {
    // Sessions on other vhosts ignore the event. An empty slot means the
    // connection has not finished connect yet.
    let vhost = state.vhost();
    if vhost.is_empty() || event.vhost() != vhost {
        return;
    }

    match event {
        ReloadEvent::VhostRemoved(_) => {
            trace!(%vhost, "vhost removed/disabled, expire session");
            state.expire();
        }
        ReloadEvent::Play(_) => {
            let smi = config.vhost(&vhost).send_min_interval;
            if smi != state.send_min_interval() {
                trace!("apply smi {}=>{}", state.send_min_interval(), smi);
                state.set_send_min_interval(smi);
            }
        }
        ReloadEvent::TcpNodelay(_) => {
            let nodelay = config.vhost(&vhost).tcp_nodelay;
            match tuner.apply_tcp_nodelay(nodelay) {
                Ok(Some(prev)) => trace!("reload TCP_NODELAY {prev}=>{nodelay}"),
                Ok(None) => {}
                Err(e) => warn!("reload TCP_NODELAY={nodelay} failed: {e}"),
            }
        }
        ReloadEvent::Realtime(_) => {
            let realtime = config.vhost(&vhost).realtime_enabled;
            if realtime != state.realtime() {
                trace!("realtime changed {}=>{}", state.realtime(), realtime);
                state.set_realtime(realtime);
            }
        }
        ReloadEvent::Publish(_) => {
            let conf = config.vhost(&vhost);
            if conf.publish_1stpkt_timeout != state.publish_1stpkt_timeout_ms() {
                trace!(
                    "p1stpt changed {}=>{}",
                    state.publish_1stpkt_timeout_ms(),
                    conf.publish_1stpkt_timeout
                );
                state.set_publish_1stpkt_timeout_ms(conf.publish_1stpkt_timeout);
            }
            if conf.publish_normal_timeout != state.publish_normal_timeout_ms() {
                trace!(
                    "pnt changed {}=>{}",
                    state.publish_normal_timeout_ms(),
                    conf.publish_normal_timeout
                );
                state.set_publish_normal_timeout_ms(conf.publish_normal_timeout);
            }
        }
    }
}
