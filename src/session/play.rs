// Play side: the delivery loop.
//
// A sidecar task owns the socket's read side and pumps inbound control
// messages; this loop owns the write side, parks on the consumer inside
// the merged-write window, and flushes batches. Control messages are
// handled strictly between batches.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, trace, warn};

use crate::error::{Result, SessionError};
use crate::protocol::{Packet, SharedMessage};
use crate::refer;
use crate::session::recv::PlayReceiveTask;
use crate::session::state::MW_MIN_MSGS;
use crate::session::SessionDriver;
use crate::source::{Consumer, Source};
use crate::telemetry::{ReportTicker, REPORT_INTERVAL};

impl SessionDriver {
    pub(crate) async fn playing(&mut self, source: &Arc<dyn Source>) -> Result<()> {
        let consumer = source.create_consumer(&self.request).await.map_err(|e| {
            error!("create consumer failed: {e}");
            e
        })?;

        // Isolated receive task so the delivery loop never blocks on the
        // socket's read side.
        let recv = PlayReceiveTask::start(
            self.protocol.clone(),
            consumer.clone(),
            self.state.child_token(),
        );

        self.state.set_wakable(&consumer);
        let ret = self.do_playing(source, &consumer, &recv).await;
        self.state.clear_wakable();

        let dropped = recv.stop().await;
        if dropped > 0 {
            warn!("drop {dropped} received messages at play exit");
        }

        ret
    }

    async fn do_playing(
        &mut self,
        _source: &Arc<dyn Source>,
        consumer: &Arc<dyn Consumer>,
        recv: &PlayReceiveTask,
    ) -> Result<()> {
        let conf = self.deps.config.vhost(&self.request.vhost);
        if conf.refer.enabled {
            refer::check(&self.request.page_url, &conf.refer.play)?;
        }

        let mut report = ReportTicker::new(REPORT_INTERVAL);
        let mut msgs: Vec<SharedMessage> = Vec::new();

        let bounded = self.request.duration_secs > 0.0;
        let duration_limit_ms = (self.request.duration_secs * 1000.0) as i64;
        let mut duration_ms: i64 = 0;
        let mut baseline_ts: i64 = -1;

        self.state.set_realtime(conf.realtime_enabled);
        // Merged write drives both the consumer wait and the socket send
        // buffer; resize the buffer whenever the window changes.
        self.state.set_mw_enabled(true);
        self.change_mw_sleep(conf.mw_sleep_ms);
        self.state.set_send_min_interval(conf.send_min_interval);

        self.set_sock_options();

        info!(
            smi = self.state.send_min_interval(),
            mw_sleep = self.state.mw_sleep_ms(),
            realtime = self.state.realtime(),
            tcp_nodelay = self.tuner.tcp_nodelay(),
            "start play"
        );

        while !self.state.is_disposed() {
            if self.state.is_expired() {
                info!("connection expired, stop play");
                return Err(SessionError::UserDisconnect);
            }

            // Control messages pumped by the receive task, strictly
            // between delivery batches.
            while let Some(msg) = recv.pump() {
                if let Err(e) = self.process_play_control_msg(consumer, msg).await {
                    if !e.is_system_control() && !e.is_graceful_close() {
                        error!("process play control message failed: {e}");
                    }
                    return Err(e);
                }
            }

            if let Some(e) = recv.take_error() {
                if !e.is_system_control() && !e.is_graceful_close() {
                    error!("play receive task failed: {e}");
                }
                return Err(e);
            }

            let mw_sleep = Duration::from_millis(self.state.mw_sleep_ms().max(0) as u64);
            if self.state.realtime() {
                // Minimal latency: flush as soon as anything arrives.
                consumer.wait(0, mw_sleep).await;
            } else {
                consumer.wait(MW_MIN_MSGS, mw_sleep).await;
            }

            // With a minimal send interval every iteration delivers at
            // most one message.
            let max_count = if self.state.send_min_interval() > 0.0 {
                1
            } else {
                0
            };
            consumer.dump_packets(&mut msgs, max_count)?;
            let count = msgs.len();

            if report.should_report() {
                self.kbps.sample();
                info!(
                    "play report age={}ms msgs={} okbps={},{},{} ikbps={},{},{} mw={}",
                    report.age().as_millis(),
                    count,
                    self.kbps.get_send_kbps(),
                    self.kbps.get_send_kbps_30s(),
                    self.kbps.get_send_kbps_5m(),
                    self.kbps.get_recv_kbps(),
                    self.kbps.get_recv_kbps_30s(),
                    self.kbps.get_recv_kbps_5m(),
                    self.state.mw_sleep_ms(),
                );
            }

            if count == 0 {
                continue;
            }

            if bounded {
                for msg in &msgs {
                    let ts = msg.header.timestamp;
                    // Reset the baseline when timestamps regress.
                    if baseline_ts < 0 || baseline_ts > ts {
                        baseline_ts = ts;
                    }
                    duration_ms += ts - baseline_ts;
                    baseline_ts = ts;
                }
            }

            let batch = std::mem::take(&mut msgs);
            if let Err(e) = self
                .protocol
                .send_and_free_messages(batch, self.stream_id)
                .await
            {
                if !e.is_graceful_close() {
                    error!("send messages to client failed: {e}");
                }
                return Err(e);
            }

            if bounded && duration_ms >= duration_limit_ms {
                trace!("stop play for duration exceeded, elapsed={duration_ms}ms");
                return Err(SessionError::DurationExceeded);
            }

            let smi = self.state.send_min_interval();
            if smi > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(smi / 1000.0)).await;
            }
        }

        Ok(())
    }

    async fn process_play_control_msg(
        &self,
        consumer: &Arc<dyn Consumer>,
        msg: SharedMessage,
    ) -> Result<()> {
        if !msg.header.kind.is_command() {
            // Media flows the other direction in play mode.
            return Ok(());
        }

        let pkt = self.protocol.decode_message(&msg)?;
        match pkt {
            // jwplayer and flowplayer send close as a soft pause.
            Packet::CloseStream => {
                trace!("system control message: rtmp close stream");
                Err(SessionError::RtmpClose)
            }
            Packet::Call { transaction_id, .. } => {
                // Zero transaction id means no response wanted.
                if transaction_id > 0.0 {
                    let res = Packet::CallResponse {
                        transaction_id,
                        command_object: None,
                        response: None,
                    };
                    if let Err(e) = self.protocol.send_and_free_packet(res, 0).await {
                        if !e.is_system_control() && !e.is_graceful_close() {
                            warn!("response call failed: {e}");
                        }
                        return Err(e);
                    }
                }
                Ok(())
            }
            Packet::Pause { is_pause, time_ms } => {
                self.protocol
                    .on_play_client_pause(self.stream_id, is_pause)
                    .await?;
                consumer.on_play_client_pause(is_pause)?;
                trace!(is_pause, time_ms, "process pause");
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
