// ABOUTME: Clock handshake between server and one client connection
// ABOUTME: Estimates latency and clock offset with median/MAD outlier rejection

use crate::error::Error;
use crate::protocol::command::ClientCommand;
use crate::protocol::messages::WireMessage;
use crate::server::clock::ServerClock;
use crate::Result;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default number of probe rounds (must be odd)
pub const HANDSHAKE_ROUNDS: usize = 5;

/// Samples further than this many MADs from the median are discarded
const OUTLIER_MADS: i64 = 3;

/// Result of a clock handshake for one member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockSync {
    /// One-way network latency in milliseconds
    pub latency_millis: i64,
    /// Milliseconds the client clock leads the server (negative = lags)
    pub offset_millis: i64,
}

impl ClockSync {
    /// Shift a server timestamp onto the client's clock
    #[inline]
    pub fn correct(&self, server_millis: i64) -> i64 {
        server_millis + self.offset_millis
    }
}

/// One probe round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeSample {
    /// Half the measured round trip
    pub latency: i64,
    /// Client clock lead for this round
    pub offset: i64,
}

impl HandshakeSample {
    /// Derive a sample from the probe send time, ack arrival time and the
    /// client's local timestamp at receipt
    pub fn measure(server_before: i64, server_after: i64, client_timestamp: i64) -> Self {
        let latency = (server_after - server_before) / 2;
        Self {
            latency,
            offset: client_timestamp - server_before - latency,
        }
    }
}

/// Median and median absolute deviation of the sample latencies
///
/// Takes the middle element after sorting, so the sample count must be odd.
pub fn median_absolute_deviation(samples: &[HandshakeSample]) -> Result<(i64, i64)> {
    if samples.len() % 2 == 0 {
        return Err(Error::Internal(format!(
            "median needs an odd sample count, got {}",
            samples.len()
        )));
    }

    let mut latencies: Vec<i64> = samples.iter().map(|s| s.latency).collect();
    latencies.sort_unstable();
    let median = latencies[latencies.len() / 2];

    let mut deviations: Vec<i64> = latencies.iter().map(|l| (l - median).abs()).collect();
    deviations.sort_unstable();
    Ok((median, deviations[deviations.len() / 2]))
}

/// Average latency and offset over the samples inside `median ± 3·MAD`
///
/// Bounds are inclusive. Averages use integer truncation.
pub fn determine_latency_and_offset(samples: &[HandshakeSample]) -> Result<ClockSync> {
    let (median, mad) = median_absolute_deviation(samples)?;
    let lower = median - OUTLIER_MADS * mad;
    let upper = median + OUTLIER_MADS * mad;

    let (kept, discarded): (Vec<&HandshakeSample>, Vec<&HandshakeSample>) = samples
        .iter()
        .partition(|s| s.latency >= lower && s.latency <= upper);

    for sample in &discarded {
        log::debug!(
            "Discarding handshake sample latency={} offset={} (band {}..={})",
            sample.latency,
            sample.offset,
            lower,
            upper
        );
    }

    if kept.is_empty() {
        return Err(Error::Internal(
            "every handshake sample was rejected as an outlier".to_string(),
        ));
    }

    let count = kept.len() as i64;
    let latency: i64 = kept.iter().map(|s| s.latency).sum();
    let offset: i64 = kept.iter().map(|s| s.offset).sum();
    Ok(ClockSync {
        latency_millis: latency / count,
        offset_millis: offset / count,
    })
}

/// Run the probe rounds over an established connection
///
/// Each round sends a probe carrying the server time and waits for the
/// matching ack. Anything other than an ack fails the handshake.
pub async fn perform_handshake<S>(
    outbound: &mpsc::UnboundedSender<WireMessage>,
    inbound: &mut S,
    clock: &ServerClock,
    rounds: usize,
) -> Result<ClockSync>
where
    S: Stream<Item = Result<WireMessage>> + Unpin,
{
    let mut samples = Vec::with_capacity(rounds);

    for round in 1..=rounds {
        let server_before = clock.now_millis();
        outbound
            .send(WireMessage::handshake_probe(server_before))
            .map_err(|_| Error::Channel("outbound channel closed during handshake".to_string()))?;

        // A peer that drops or breaks mid-handshake violated the protocol
        let reply = match inbound.next().await {
            Some(Ok(reply)) => reply,
            Some(Err(Error::Channel(reason))) => {
                return Err(Error::Protocol(format!(
                    "read failed during handshake round {}: {}",
                    round, reason
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(Error::Protocol(
                    "connection closed during handshake".to_string(),
                ));
            }
        };
        let server_after = clock.now_millis();

        match ClientCommand::decode(reply)? {
            ClientCommand::HandshakeAck(client_timestamp) => {
                samples.push(HandshakeSample::measure(
                    server_before,
                    server_after,
                    client_timestamp,
                ));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected handshake ack in round {}, got {:?}",
                    round, other
                )));
            }
        }
    }

    determine_latency_and_offset(&samples)
}

/// Bounded handshake that always tells the peer the phase has ended
///
/// The terminating zero-timestamp probe is sent on success and on failure.
pub async fn negotiate_clock<S>(
    outbound: &mpsc::UnboundedSender<WireMessage>,
    inbound: &mut S,
    clock: &ServerClock,
    rounds: usize,
    timeout: Duration,
) -> Result<ClockSync>
where
    S: Stream<Item = Result<WireMessage>> + Unpin,
{
    let result = match tokio::time::timeout(
        timeout,
        perform_handshake(outbound, inbound, clock, rounds),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "no handshake ack within {}ms",
            timeout.as_millis()
        ))),
    };

    let _ = outbound.send(WireMessage::handshake_probe(0));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::ServerTag;
    use futures_util::stream;

    fn samples(pairs: &[(i64, i64)]) -> Vec<HandshakeSample> {
        pairs
            .iter()
            .map(|&(latency, offset)| HandshakeSample { latency, offset })
            .collect()
    }

    #[test]
    fn test_median_absolute_deviation() {
        let cases = [
            // Simple input
            (vec![(1, 0), (2, 0), (3, 0), (4, 0), (5, 0)], 3, 1),
            // Unsorted input
            (vec![(34, 0), (56, 0), (4, 0), (64, 0), (435, 0)], 56, 22),
            // All zeroes
            (vec![(0, 0), (0, 0), (0, 0), (0, 0), (0, 0)], 0, 0),
        ];

        for (input, want_median, want_mad) in cases {
            let (median, mad) = median_absolute_deviation(&samples(&input)).unwrap();
            assert_eq!(median, want_median, "median of {:?}", input);
            assert_eq!(mad, want_mad, "MAD of {:?}", input);
        }
    }

    #[test]
    fn test_median_rejects_even_count() {
        let result = median_absolute_deviation(&samples(&[(1, 0), (2, 0)]));
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_determine_latency_and_offset() {
        let cases = [
            // Band 0..=6 keeps every sample
            (vec![(1, 1), (2, 3), (3, 3), (4, 14), (5, 99)], 3, 24),
            // Upper outlier
            (vec![(12, -2), (34, 11), (30, 3), (15, 0), (12312, 12)], 22, 3),
            // Lower outlier
            (vec![(150, 4), (160, 3), (233, 4), (170, 5), (1, 13)], 160, 4),
            // All zeroes: MAD 0 keeps the exact median
            (vec![(0, 0), (0, 0), (0, 0), (0, 0), (0, 0)], 0, 0),
            // MAD 0 with stragglers: only latencies equal to the median survive
            (vec![(10, 6), (10, 8), (10, 10), (11, 500), (50, -900)], 10, 8),
        ];

        for (input, want_latency, want_offset) in cases {
            let sync = determine_latency_and_offset(&samples(&input)).unwrap();
            assert_eq!(sync.latency_millis, want_latency, "latency of {:?}", input);
            assert_eq!(sync.offset_millis, want_offset, "offset of {:?}", input);
        }
    }

    #[test]
    fn test_negative_offsets_truncate_toward_zero() {
        let input = samples(&[(2, -1), (2, -1), (2, -2), (2, 0), (2, 0)]);
        let sync = determine_latency_and_offset(&input).unwrap();
        assert_eq!(sync.offset_millis, 0);
    }

    #[test]
    fn test_measure_sample() {
        // Probe sent at 1000, ack back at 1040, client stamped 1270 on receipt
        let sample = HandshakeSample::measure(1_000, 1_040, 1_270);
        assert_eq!(sample.latency, 20);
        assert_eq!(sample.offset, 250);
    }

    #[test]
    fn test_correct_applies_offset() {
        let sync = ClockSync {
            latency_millis: 15,
            offset_millis: -120,
        };
        assert_eq!(sync.correct(10_000), 9_880);
    }

    #[tokio::test]
    async fn test_handshake_with_simulated_client() {
        let clock = ServerClock::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel::<Result<WireMessage>>();

        // Client clock runs 5 seconds ahead of the server
        let client = tokio::spawn(async move {
            let mut probes = Vec::new();
            while let Some(probe) = probe_rx.recv().await {
                let ts = probe.timestamp_millis.unwrap_or(0);
                probes.push(probe.clone());
                if ts == 0 {
                    break;
                }
                let ack = ClientCommand::HandshakeAck(ts + 5_000).encode();
                let _ = ack_tx.send(Ok(ack));
            }
            probes
        });

        let mut inbound = Box::pin(stream::unfold(ack_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        }));

        let sync = negotiate_clock(
            &probe_tx,
            &mut inbound,
            &clock,
            HANDSHAKE_ROUNDS,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // In-process round trips are near zero
        assert!(sync.latency_millis <= 5);
        assert!((sync.offset_millis - 5_000).abs() <= 5);

        let probes = client.await.unwrap();
        assert_eq!(probes.len(), HANDSHAKE_ROUNDS + 1);
        assert!(probes.iter().all(|p| p.command == ServerTag::Handshake.code()));
        assert_eq!(probes.last().unwrap().timestamp_millis, Some(0));
    }

    #[tokio::test]
    async fn test_handshake_fails_on_non_ack() {
        let clock = ServerClock::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel::<WireMessage>();
        let mut inbound = stream::iter(vec![
            Ok(ClientCommand::HandshakeAck(100).encode()),
            Ok(ClientCommand::VoteSkip.encode()),
        ]);

        let result = negotiate_clock(
            &probe_tx,
            &mut inbound,
            &clock,
            HANDSHAKE_ROUNDS,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(Error::Protocol(_))));

        // Two probes, then the terminating one
        let mut sent = Vec::new();
        while let Ok(msg) = probe_rx.try_recv() {
            sent.push(msg);
        }
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].timestamp_millis, Some(0));
    }

    #[tokio::test]
    async fn test_handshake_fails_on_close() {
        let clock = ServerClock::new();
        let (probe_tx, _probe_rx) = mpsc::unbounded_channel::<WireMessage>();
        let mut inbound = stream::iter(Vec::<Result<WireMessage>>::new());

        let result = perform_handshake(&probe_tx, &mut inbound, &clock, HANDSHAKE_ROUNDS).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ref r)) if r == "connection closed during handshake"
        ));
    }

    #[tokio::test]
    async fn test_handshake_read_failure_is_protocol_error() {
        let clock = ServerClock::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel::<WireMessage>();
        let mut inbound = stream::iter(vec![
            Ok(ClientCommand::HandshakeAck(100).encode()),
            Err(Error::Channel("client closed connection".to_string())),
        ]);

        let result = negotiate_clock(
            &probe_tx,
            &mut inbound,
            &clock,
            HANDSHAKE_ROUNDS,
            Duration::from_secs(5),
        )
        .await;
        match result {
            Err(Error::Protocol(reason)) => {
                assert!(reason.contains("round 2"), "{}", reason);
                assert!(reason.contains("client closed connection"), "{}", reason);
            }
            other => panic!("expected protocol error, got {:?}", other),
        }

        // Still told the handshake is over
        let mut last = None;
        while let Ok(msg) = probe_rx.try_recv() {
            last = Some(msg);
        }
        assert_eq!(last.unwrap().timestamp_millis, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_times_out() {
        let clock = ServerClock::new();
        let (probe_tx, mut probe_rx) = mpsc::unbounded_channel::<WireMessage>();
        let mut inbound = stream::pending::<Result<WireMessage>>();

        let result = negotiate_clock(
            &probe_tx,
            &mut inbound,
            &clock,
            HANDSHAKE_ROUNDS,
            Duration::from_millis(250),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        let first = probe_rx.try_recv().unwrap();
        assert_ne!(first.timestamp_millis, Some(0));
        let last = probe_rx.try_recv().unwrap();
        assert_eq!(last.timestamp_millis, Some(0));
    }
}
