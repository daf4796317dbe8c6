// Publish side.
//
// The sidecar receive task reads and dispatches every publisher message;
// the driver only enforces the timeout ladder (first packet vs steady
// state) by watching the message counter advance, and owns the
// acquire/release lifecycle on the Source.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, trace, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{Packet, ProtocolSession, SharedMessage, STREAM_BUSY_SLEEP};
use crate::refer;
use crate::session::recv::PublishReceiveTask;
use crate::session::SessionDriver;
use crate::source::Source;
use crate::telemetry::{ReportTicker, REPORT_INTERVAL};

impl SessionDriver {
    pub(crate) async fn publishing(
        &mut self,
        source: &Arc<dyn Source>,
        is_fmle: bool,
    ) -> Result<()> {
        let conf = self.deps.config.vhost(&self.request.vhost);
        if conf.refer.enabled {
            refer::check(&self.request.page_url, &conf.refer.publish)?;
        }

        self.http_hooks_on_publish().await?;

        let vhost_is_edge = conf.is_edge;
        let ret = match self.acquire_publish(source, vhost_is_edge).await {
            Ok(()) => {
                let recv = PublishReceiveTask::start(
                    self.protocol.clone(),
                    source.clone(),
                    self.stream_id,
                    is_fmle,
                    vhost_is_edge,
                    self.state.child_token(),
                );
                let r = self.do_publishing(&recv).await;
                recv.stop().await;
                r
            }
            Err(e) => Err(e),
        };

        // Acquire can fail after partially changing publish state, so
        // release always runs. Busy is the exception: the stream still
        // belongs to the other publisher.
        if matches!(ret, Err(SessionError::StreamBusy)) {
            tokio::time::sleep(STREAM_BUSY_SLEEP).await;
        } else {
            self.release_publish(source, vhost_is_edge).await;
        }

        self.http_hooks_on_unpublish().await;

        ret
    }

    async fn do_publishing(&mut self, recv: &PublishReceiveTask) -> Result<()> {
        let conf = self.deps.config.vhost(&self.request.vhost);

        // Both timeouts start from the first-packet key; reload fixes the
        // normal one up from its own key afterwards.
        self.state
            .set_publish_1stpkt_timeout_ms(conf.publish_1stpkt_timeout);
        self.state
            .set_publish_normal_timeout_ms(conf.publish_1stpkt_timeout);

        self.set_sock_options();

        info!(
            mr = conf.mr_enabled,
            mr_sleep = conf.mr_sleep_ms,
            p1stpt = self.state.publish_1stpkt_timeout_ms(),
            pnt = self.state.publish_normal_timeout_ms(),
            tcp_nodelay = self.tuner.tcp_nodelay(),
            "start publish"
        );

        let mut report = ReportTicker::new(REPORT_INTERVAL);
        let mut nb_msgs: i64 = 0;

        while !self.state.is_disposed() {
            if self.state.is_expired() {
                info!("connection expired, stop publish");
                return Err(SessionError::UserDisconnect);
            }

            let timeout_ms = if nb_msgs == 0 {
                self.state.publish_1stpkt_timeout_ms()
            } else {
                self.state.publish_normal_timeout_ms()
            };
            recv.wait(Duration::from_millis(timeout_ms.max(0) as u64))
                .await;

            if let Some(e) = recv.take_error() {
                if !e.is_system_control() && !e.is_graceful_close() {
                    error!("publish receive task failed: {e}");
                }
                return Err(e);
            }

            // No progress within the window: the encoder is gone.
            if recv.nb_msgs() <= nb_msgs {
                warn!(
                    timeout_ms,
                    nb_msgs, "publish timeout, no message in window"
                );
                return Err(SessionError::SocketTimeout);
            }
            nb_msgs = recv.nb_msgs();

            if report.should_report() {
                self.kbps.sample();
                info!(
                    "publish report age={}ms okbps={},{},{} ikbps={},{},{} mr={}/{} p1stpt={} pnt={}",
                    report.age().as_millis(),
                    self.kbps.get_send_kbps(),
                    self.kbps.get_send_kbps_30s(),
                    self.kbps.get_send_kbps_5m(),
                    self.kbps.get_recv_kbps(),
                    self.kbps.get_recv_kbps_30s(),
                    self.kbps.get_recv_kbps_5m(),
                    conf.mr_enabled,
                    conf.mr_sleep_ms,
                    self.state.publish_1stpkt_timeout_ms(),
                    self.state.publish_normal_timeout_ms(),
                );
            }
        }

        Ok(())
    }

    async fn acquire_publish(&self, source: &Arc<dyn Source>, is_edge: bool) -> Result<()> {
        if !source.can_publish(is_edge) {
            warn!(url = %self.request.stream_url(), "stream is already publishing");
            return Err(SessionError::StreamBusy);
        }

        // Edge proxies the publish upstream instead of taking it.
        if is_edge {
            source.on_edge_start_publish().await.map_err(|e| {
                error!("notify edge start publish failed: {e}");
                e
            })
        } else {
            source.on_publish().await.map_err(|e| {
                error!("notify publish failed: {e}");
                e
            })
        }
    }

    async fn release_publish(&self, source: &Arc<dyn Source>, is_edge: bool) {
        if is_edge {
            source.on_edge_proxy_unpublish().await;
        } else {
            source.on_unpublish().await;
        }
    }
}

/// Dispatch one publisher message: commands steer the stream lifecycle,
/// everything else flows into the Source. Runs on the receive task.
pub(crate) async fn handle_publish_message(
    protocol: &Arc<dyn ProtocolSession>,
    source: &Arc<dyn Source>,
    msg: SharedMessage,
    stream_id: u32,
    is_fmle: bool,
    vhost_is_edge: bool,
) -> Result<()> {
    if msg.header.kind.is_command() {
        let pkt = protocol.decode_message(&msg)?;

        // A flash publisher signals republish with any command.
        if !is_fmle {
            trace!("flash publish finished");
            return Err(SessionError::Republish);
        }

        if let Packet::FmleStart { transaction_id, .. } = pkt {
            protocol.fmle_unpublish(stream_id, transaction_id).await?;
            return Err(SessionError::Republish);
        }

        trace!("ignore AMF command during fmle publish");
        return Ok(());
    }

    process_publish_message(protocol, source, msg, vhost_is_edge).await
}

async fn process_publish_message(
    protocol: &Arc<dyn ProtocolSession>,
    source: &Arc<dyn Source>,
    msg: SharedMessage,
    vhost_is_edge: bool,
) -> Result<()> {
    // Edge forwards everything to the origin untouched.
    if vhost_is_edge {
        return source.on_edge_proxy_publish(msg).await;
    }

    let kind = msg.header.kind;
    if kind.is_audio() {
        return source.on_audio(msg).await;
    }
    if kind.is_video() {
        return source.on_video(msg).await;
    }
    if kind.is_aggregate() {
        return source.on_aggregate(msg).await;
    }
    if kind.is_data() {
        let pkt = protocol.decode_message(&msg)?;
        if let Packet::OnMetaData { metadata } = pkt {
            return source.on_meta_data(msg, &metadata).await;
        }
        trace!("ignore AMF data message");
    }

    Ok(())
}
