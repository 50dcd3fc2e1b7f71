//! The end-to-end probe run
//!
//! ```text
//! register ─► offer ─► INVITE (407 ─► INVITE) ─► answer/ACK ─► media ─► DTMF ─► hold ─► dispose
//! ```
//!
//! Every step below the initiator and the completion task degrades to an
//! empty result; this is the one place that turns "no connected call" into
//! an error.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::completion::{complete_call, CallOutcome};
use crate::config::ProbeConfig;
use crate::error::{CallProbeError, CallProbeResult};
use crate::initiator::CallInitiator;
use crate::media::MediaEngine;
use crate::signaling::{SipHeader, UserAgent};
use crate::tone::ToneReport;

/// What a successful run observed
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub call_id: String,
    pub target: String,
    pub local_address: IpAddr,
    /// 1 when the proxy accepted the first INVITE, 2 after a challenge
    pub invites_sent: u8,
    pub outcome: String,
    /// Connection mode once the media session was up
    pub connection_mode: String,
    /// `None` when the sequence was still running at the end of the hold
    pub tones: Option<ToneReport>,
    pub hold_ms: u64,
}

/// Run one probe call
///
/// # Errors
///
/// Configuration and registration errors are returned as they are. Any way
/// the call itself fails to connect is reported as `CallFailed`.
pub async fn run_scenario(
    config: &ProbeConfig,
    user_agent: &dyn UserAgent,
    engine: Arc<dyn MediaEngine>,
) -> CallProbeResult<ScenarioReport> {
    config.validate()?;
    let sequence = config.tone_sequence()?;
    let local_address = config.resolve_local_address();

    let span = info_span!("scenario", target = %config.target, local = %local_address);
    async move {
        user_agent
            .register(&config.credential, config.register_expires)
            .await?;
        info!(user = %config.credential.user, expires = config.register_expires, "Registered");

        let connection = engine.create_connection()?;
        let offer = connection.generate_local_descriptor()?;
        let contact = SipHeader::new(
            "Contact",
            format!("<sip:{}@{}>", config.credential.user, local_address),
        );

        let pending = CallInitiator::new(user_agent)
            .attempt_call(&config.target, &config.from, &config.credential, vec![contact], Some(offer))
            .await;
        let Some(pending) = pending else {
            connection.close();
            return Err(CallProbeError::call_failed("INVITE was not accepted"));
        };
        let invites_sent = pending.invites_sent();

        let outcome = complete_call(pending, connection, engine, config.completion_settings())
            .outcome()
            .await;
        let label = outcome.label();
        let call = match outcome {
            CallOutcome::Answered(call) => call,
            CallOutcome::TimedOut(call) | CallOutcome::Rejected { call, .. } => {
                call.dispose().await;
                return Err(CallProbeError::call_failed(format!("call {}", label)));
            }
            CallOutcome::SetupFailed { reason, call } => {
                if let Some(call) = call {
                    call.dispose().await;
                }
                return Err(CallProbeError::call_failed(reason));
            }
        };
        let connection_mode = call.rtp_connection().mode().to_string();

        let tones = match call.play_tones(sequence) {
            Ok(tones) => tones,
            Err(e) => {
                call.dispose().await;
                return Err(e);
            }
        };

        info!(call_id = %call.call_id(), digits = %config.digits, hold_ms = config.hold_ms, "Holding call");
        tokio::time::sleep(config.hold()).await;

        let tones = if tones.is_finished() {
            match tones.wait().await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(error = %e, "DTMF sequence failed");
                    None
                }
            }
        } else {
            warn!("DTMF sequence still running at end of hold, stopping it");
            tones.abort();
            None
        };

        let report = ScenarioReport {
            call_id: call.call_id().to_string(),
            target: config.target.clone(),
            local_address,
            invites_sent,
            outcome: label.to_string(),
            connection_mode,
            tones,
            hold_ms: config.hold_ms,
        };
        call.dispose().await;
        info!(call_id = %report.call_id, "Probe call finished");
        Ok(report)
    }
    .instrument(span)
    .await
}
