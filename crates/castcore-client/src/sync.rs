//! The two packet sync loops: an unreliable realtime loop (media, input,
//! pings — sub-millisecond per-tick budget) and a reliable 25ms-cadence
//! loop (bulk async data plus the congestion controller's bitrate
//! announcements and NACK-driven control messages).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use castcore_crypto::{decrypt, encrypt};
use castcore_protocol::fragment::Fragment;
use castcore_protocol::{ClientMessage, CoreError, ServerMessage};

use crate::client::{nack_action_to_message, ClientSession, Delivery};
use crate::session::{Reliable, Transport, Unreliable};

/// Cadence of the reliable control loop: one dispatch/poll pass every
/// 25ms, well within the threshold where TCP's own retransmission
/// timers would otherwise dominate perceived latency for control
/// traffic riding alongside bulk data.
const RELIABLE_LOOP_INTERVAL: Duration = Duration::from_millis(25);

/// The realtime loop spends as little time as possible per iteration;
/// this bounds each `recv` attempt so NACK/keyframe timers still run
/// even under total silence from the server.
const UNRELIABLE_RECV_BUDGET: Duration = Duration::from_millis(5);

pub async fn run_unreliable_loop(
    session: Arc<Mutex<ClientSession>>,
    mut transport: Unreliable,
    key: [u8; 16],
    delivery_tx: mpsc::UnboundedSender<Delivery>,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    transport.set_timeout(UNRELIABLE_RECV_BUDGET);
    let mut recv_buf = vec![0u8; 64 * 1024];

    loop {
        while let Ok(msg) = outbound_rx.try_recv() {
            let mut guard = session.lock().await;
            if let Err(e) = send_unreliable_message(&mut guard, &mut transport, &key, &msg).await {
                warn!("failed to send queued unreliable message: {e}");
            }
        }

        match transport.recv_datagram(&mut recv_buf).await {
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = handle_unreliable_datagram(&session, &recv_buf[..n], &key, &delivery_tx).await {
                    warn!("dropping malformed unreliable datagram: {e}");
                }
            }
            Err(e) => {
                error!("unreliable transport read failed: {e}");
                let _ = delivery_tx.send(Delivery::Quit);
                return;
            }
        }

        let now = Instant::now();
        let mut guard = session.lock().await;

        if let Err(e) = guard.audio_tick() {
            warn!("audio playout tick failed: {e}");
        }
        guard.present_video();

        let mut outbound = Vec::new();
        for (kind, action) in guard.poll_control_nacks(now) {
            outbound.push(nack_action_to_message(kind, action));
        }
        for action in guard.poll_audio_nacks(now) {
            outbound.push(nack_action_to_message(castcore_protocol::Kind::Audio, action));
        }
        if guard.video_waiting_for_keyframe() && guard.request_video_keyframe_if_due(now) {
            outbound.push(ClientMessage::IframeRequest);
        }

        for msg in outbound {
            if let Err(e) = send_unreliable_message(&mut guard, &mut transport, &key, &msg).await {
                warn!("failed to send control message over unreliable channel: {e}");
            }
        }
    }
}

async fn handle_unreliable_datagram(
    session: &Arc<Mutex<ClientSession>>,
    datagram: &[u8],
    key: &[u8; 16],
    delivery_tx: &mpsc::UnboundedSender<Delivery>,
) -> Result<(), CoreError> {
    let plaintext = decrypt(datagram, key)?;
    let fragment = Fragment::from_bytes(&plaintext)?;

    let mut guard = session.lock().await;
    if let Some(delivery) = guard.on_unreliable_fragment(fragment)? {
        let _ = delivery_tx.send(delivery);
    }
    Ok(())
}

async fn send_unreliable_message(
    session: &mut ClientSession,
    transport: &mut Unreliable,
    key: &[u8; 16],
    msg: &ClientMessage,
) -> Result<(), CoreError> {
    for fragment in session.fragment_outbound_message(msg)? {
        let ciphertext = encrypt(&fragment.to_bytes(), key);
        transport
            .send_datagram(&ciphertext)
            .await
            .map_err(|e| CoreError::TransportLost(e.to_string()))?;
    }
    Ok(())
}

pub async fn run_reliable_loop(
    session: Arc<Mutex<ClientSession>>,
    mut transport: Reliable,
    key: [u8; 16],
    mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    delivery_tx: mpsc::UnboundedSender<Delivery>,
) {
    transport.set_timeout(RELIABLE_LOOP_INTERVAL);
    let mut recv_buf = vec![0u8; 64 * 1024];

    loop {
        let tick_start = Instant::now();

        if let Ok(msg) = outbound_rx.try_recv() {
            if let Err(e) = send_reliable_message(&session, &mut transport, &key, &msg).await {
                error!("failed to send reliable message: {e}");
            }
        }

        match transport.recv_datagram(&mut recv_buf).await {
            Ok(0) => {}
            Ok(n) => match decrypt(&recv_buf[..n], &key) {
                Ok(plaintext) => {
                    let guard = session.lock().await;
                    match guard.decode_reliable_message(&plaintext) {
                        Ok(ServerMessage::Quit) => {
                            let _ = delivery_tx.send(Delivery::Quit);
                            return;
                        }
                        Ok(msg) => {
                            let _ = delivery_tx.send(Delivery::Server(msg));
                        }
                        Err(e) => warn!("malformed reliable message: {e}"),
                    }
                }
                Err(e) => warn!("failed to decrypt reliable datagram: {e}"),
            },
            Err(e) => {
                error!("reliable transport read failed: {e}");
                let _ = delivery_tx.send(Delivery::Quit);
                return;
            }
        }

        let recommendation = {
            let mut guard = session.lock().await;
            guard.bitrate_tick(Instant::now())
        };
        if let Some(recommendation) = recommendation {
            debug!(?recommendation, "bitrate window closed, reporting estimate to server");
            let msg = ClientMessage::Bitrate {
                bitrate_kbps: recommendation.target_kbps,
                burst_bitrate_kbps: recommendation.burst_kbps,
            };
            if let Err(e) = send_reliable_message(&session, &mut transport, &key, &msg).await {
                warn!("failed to send bitrate estimate: {e}");
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < RELIABLE_LOOP_INTERVAL {
            tokio::time::sleep(RELIABLE_LOOP_INTERVAL - elapsed).await;
        }
    }
}

async fn send_reliable_message(
    session: &Arc<Mutex<ClientSession>>,
    transport: &mut Reliable,
    key: &[u8; 16],
    msg: &ClientMessage,
) -> Result<(), CoreError> {
    let plaintext = {
        let guard = session.lock().await;
        guard.encode_reliable_message(msg)?
    };
    let ciphertext = encrypt(&plaintext, key);
    transport
        .send_datagram(&ciphertext)
        .await
        .map_err(|e| CoreError::TransportLost(e.to_string()))
}

/// Reassembles a multi-fragment payload from a set of already-decrypted,
/// already-parsed fragments sharing one frame id. Exercised directly in
/// tests; production traffic never needs it because `FrameRing` does
/// this reassembly fragment-by-fragment as packets arrive.
#[cfg(test)]
fn reassemble_for_test(fragments: &[Fragment]) -> Vec<u8> {
    use castcore_protocol::fragment::{defragment, MAX_PAYLOAD};
    let num_orig = fragments[0].num_orig();
    let num_fec = fragments[0].num_fec_indices as usize;
    let slots: Vec<Option<Fragment>> = fragments.iter().cloned().map(Some).collect();
    defragment(&slots, num_orig, num_fec, MAX_PAYLOAD).expect("defragment succeeds with all fragments present")
}

#[cfg(test)]
mod tests {
    use super::*;
    use castcore_protocol::fragment::fragment_frame;
    use castcore_protocol::Kind;

    #[test]
    fn reassembles_a_small_single_fragment_message() {
        let payload = postcard::to_allocvec(&ClientMessage::UdpPing { id: 3 }).unwrap();
        let fragments = fragment_frame(&payload, Kind::Message, 0, MAX_PAYLOAD, 0.0, false).unwrap();
        let reassembled = reassemble_for_test(&fragments);
        assert_eq!(reassembled, payload);
    }
}
