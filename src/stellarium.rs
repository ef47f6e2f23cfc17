// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use log::{info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

pub const DEFAULT_PORT: u16 = 10_001;

const PACKET_SIZE: usize = 24;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RELISTEN_BACKOFF: Duration = Duration::from_secs(10);

/// The pointing shared with the planetarium client. The solve applier posts
/// here; the broadcast task drains `has_update`.
#[derive(Debug, Default)]
pub struct CelestialPosition {
    pub ra: f64,  // 0..360
    pub dec: f64, // -90..90
    pub has_update: bool,
}

impl CelestialPosition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a new pointing. Flags an update only when the position rounded
    /// to two decimals differs from the last posted one, so an idle scope
    /// does not spam the wire.
    pub fn update(&mut self, ra: f64, dec: f64) -> bool {
        let changed = round2(ra) != round2(self.ra)
            || round2(dec) != round2(self.dec);
        self.ra = ra;
        self.dec = dec;
        if changed {
            self.has_update = true;
        }
        changed
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Encodes the 24-byte little-endian position packet of the Stellarium
/// telescope-control protocol.
pub fn encode_position(ra_deg: f64, dec_deg: f64, time: SystemTime) -> [u8; PACKET_SIZE] {
    let ra_hours = ra_deg / 15.0;
    let ra_int = (ra_hours * (u32::MAX as f64 + 1.0) / 24.0).round() as i64 as u32;
    let dec_int = (dec_deg * ((1u32 << 30) as f64 / 90.0)).round() as i32;
    let time_us = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros() as i64;

    let mut packet = [0u8; PACKET_SIZE];
    packet[0..2].copy_from_slice(&(PACKET_SIZE as i16).to_le_bytes());
    packet[2..4].copy_from_slice(&0i16.to_le_bytes()); // Message type.
    packet[4..12].copy_from_slice(&time_us.to_le_bytes());
    packet[12..16].copy_from_slice(&ra_int.to_le_bytes());
    packet[16..20].copy_from_slice(&dec_int.to_le_bytes());
    packet[20..24].copy_from_slice(&0i32.to_le_bytes()); // Status.
    packet
}

/// Serves the current pointing to a single planetarium client. Holds the
/// accepted connection open, emitting a packet whenever `has_update` is set;
/// on any I/O failure it backs off and re-enters the listen state. Runs
/// until `running` clears.
pub async fn run_broadcast(
    position: Arc<Mutex<CelestialPosition>>,
    port: u16,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("planetarium listen on port {} failed: {}", port, e);
                backoff(&running).await;
                continue;
            }
        };
        info!("waiting for planetarium client on port {}", port);

        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("planetarium client connected from {}", peer);
                    stream
                }
                Err(e) => {
                    warn!("planetarium accept failed: {}", e);
                    backoff(&running).await;
                    continue;
                }
            },
            _ = wait_for_stop(&running) => return,
        };

        if let Err(e) = serve_client(stream, &position, &running).await {
            warn!("planetarium client lost: {}", e);
            backoff(&running).await;
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    position: &Mutex<CelestialPosition>,
    running: &AtomicBool,
) -> std::io::Result<()> {
    loop {
        if !running.load(Ordering::Acquire) {
            return Ok(());
        }
        let pending = {
            let mut locked = position.lock().unwrap();
            if locked.has_update {
                locked.has_update = false;
                Some((locked.ra, locked.dec))
            } else {
                None
            }
        };
        if let Some((ra, dec)) = pending {
            let packet = encode_position(ra, dec, SystemTime::now());
            stream.write_all(&packet).await?;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// Sleep the re-listen backoff, but stay responsive to shutdown.
async fn backoff(running: &AtomicBool) {
    let deadline = std::time::Instant::now() + RELISTEN_BACKOFF;
    while running.load(Ordering::Acquire)
        && std::time::Instant::now() < deadline
    {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_packet_layout() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_micros(1_234_567);
        let packet = encode_position(279.2437, 38.7861, time);

        assert_eq!(i16::from_le_bytes([packet[0], packet[1]]), 24);
        assert_eq!(i16::from_le_bytes([packet[2], packet[3]]), 0);
        let time_us =
            i64::from_le_bytes(packet[4..12].try_into().unwrap());
        assert_eq!(time_us, 1_234_567);

        let ra_int = u32::from_le_bytes(packet[12..16].try_into().unwrap());
        let dec_int = i32::from_le_bytes(packet[16..20].try_into().unwrap());
        let expected_ra =
            (279.2437 / 15.0 * (u32::MAX as f64 + 1.0) / 24.0).round() as u32;
        let expected_dec =
            (38.7861 * ((1u32 << 30) as f64 / 90.0)).round() as i32;
        assert_eq!(ra_int, expected_ra);
        assert_eq!(dec_int, expected_dec);

        assert_eq!(i32::from_le_bytes(packet[20..24].try_into().unwrap()), 0);
    }

    #[test]
    fn test_packet_zero_position() {
        let packet =
            encode_position(0.0, 0.0, SystemTime::UNIX_EPOCH);
        assert_eq!(&packet[0..4], &[24, 0, 0, 0]);
        assert!(packet[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_negative_declination_encoding() {
        let packet =
            encode_position(0.0, -45.0, SystemTime::UNIX_EPOCH);
        let dec_int = i32::from_le_bytes(packet[16..20].try_into().unwrap());
        assert_eq!(dec_int, -(1 << 29));
    }

    #[test]
    fn test_update_flags_only_rounded_changes() {
        let mut position = CelestialPosition::new();
        assert!(position.update(279.2437, 38.7861));
        assert!(position.has_update);
        position.has_update = false;

        // Sub-centidegree motion: no new packet.
        assert!(!position.update(279.2441, 38.7859));
        assert!(!position.has_update);

        assert!(position.update(279.2541, 38.7861));
        assert!(position.has_update);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_serves_single_client() {
        let position = Arc::new(Mutex::new(CelestialPosition::new()));
        let running = Arc::new(AtomicBool::new(true));
        // Port in the dynamic range, unlikely to collide across test runs.
        let port = 51_431;

        let server = tokio::spawn(run_broadcast(
            position.clone(),
            port,
            running.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client =
            TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        position.lock().unwrap().update(279.2437, 38.7861);

        let mut packet = [0u8; PACKET_SIZE];
        tokio::time::timeout(
            Duration::from_secs(2),
            client.read_exact(&mut packet),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(i16::from_le_bytes([packet[0], packet[1]]), 24);
        assert!(!position.lock().unwrap().has_update);

        running.store(false, Ordering::Release);
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await;
    }
}
