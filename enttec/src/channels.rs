/*!
Shared DMX channel buffer.

The buffer holds the start code followed by 512 channel values. Render code
writes into it from any thread while the output loop copies it out once per
cycle. A single mutex covers the buffer; it is held only for the duration of
a 513-byte copy in either direction, never across a transport write, so a
render call waits at most one memcpy for the output loop.
*/

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{DmxError, Result};
use crate::protocol::{DMX_CHANNELS, DMX_FRAME_LEN, DMX_START_CODE};

/// Buffer contents plus a version counter bumped on every update
#[derive(Debug)]
struct Inner {
    data: [u8; DMX_FRAME_LEN],
    version: u64,
}

/// Start code + 512 channels shared between render and output
#[derive(Debug)]
pub struct ChannelBuffer {
    inner: Mutex<Inner>,
}

/// Immutable copy of the buffer taken at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u64,
    pub data: [u8; DMX_FRAME_LEN],
}

impl Snapshot {
    /// Start code and the first `register_count` channels
    pub fn frame(&self, register_count: usize) -> &[u8] {
        &self.data[..1 + register_count.min(DMX_CHANNELS)]
    }

    /// The 512 channel values without the start code
    pub fn channels(&self) -> &[u8] {
        &self.data[1..]
    }

    /// Value of a 1-based channel
    pub fn channel(&self, channel: usize) -> Option<u8> {
        if (1..=DMX_CHANNELS).contains(&channel) {
            Some(self.data[channel])
        } else {
            None
        }
    }
}

impl ChannelBuffer {
    /// Create a zeroed buffer with the null start code
    pub fn new() -> Self {
        let mut data = [0u8; DMX_FRAME_LEN];
        data[0] = DMX_START_CODE;

        Self {
            inner: Mutex::new(Inner { data, version: 0 }),
        }
    }

    /// Write `values` into channels 1..=len; channels past the end keep their value
    pub fn update(&self, values: &[u8]) -> Result<u64> {
        self.update_at(1, values)
    }

    /// Write a run of values starting at a 1-based channel
    pub fn update_at(&self, first: usize, values: &[u8]) -> Result<u64> {
        if !(1..=DMX_CHANNELS).contains(&first) {
            return Err(DmxError::NoSuchChannel(first));
        }

        let max = DMX_CHANNELS - first + 1;
        if values.len() > max {
            return Err(DmxError::ChannelOverflow {
                first,
                count: values.len(),
                max,
            });
        }

        let mut inner = self.lock();
        inner.data[first..first + values.len()].copy_from_slice(values);
        inner.version += 1;
        Ok(inner.version)
    }

    /// Set every channel to zero
    pub fn blackout(&self) -> u64 {
        let mut inner = self.lock();
        inner.data[1..].fill(0);
        inner.version += 1;
        inner.version
    }

    /// Copy the whole buffer out
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            version: inner.version,
            data: inner.data,
        }
    }

    /// Number of completed updates so far
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section is a plain copy, so a poisoned guard still holds whole data
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ChannelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a buffer as hex rows of 16 channels, labelled with the first channel number
pub fn format_channels(channels: &[u8]) -> String {
    channels
        .chunks(16)
        .enumerate()
        .map(|(row, chunk)| format!("{:03}: {}", row * 16 + 1, hex::encode(chunk)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_new_buffer_is_zeroed() {
        let buffer = ChannelBuffer::new();
        let snapshot = buffer.snapshot();

        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.data.len(), DMX_FRAME_LEN);
        assert_eq!(snapshot.data[0], DMX_START_CODE);
        assert!(snapshot.channels().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_partial_update_keeps_remaining_channels() {
        let buffer = ChannelBuffer::new();
        buffer.update(&[9; 20]).unwrap();
        buffer.update(&[1, 2, 3]).unwrap();

        let snapshot = buffer.snapshot();
        assert_eq!(&snapshot.data[1..4], &[1, 2, 3]);
        assert_eq!(&snapshot.data[4..21], &[9; 17]);
        assert_eq!(snapshot.data[21], 0);
        assert_eq!(snapshot.version, 2);
    }

    #[test]
    fn test_update_at_bounds() {
        let buffer = ChannelBuffer::new();

        buffer.update_at(512, &[255]).unwrap();
        assert_eq!(buffer.snapshot().channel(512), Some(255));

        assert!(matches!(buffer.update_at(0, &[1]), Err(DmxError::NoSuchChannel(0))));
        assert!(matches!(buffer.update_at(513, &[1]), Err(DmxError::NoSuchChannel(513))));
        assert!(matches!(
            buffer.update_at(511, &[1, 2, 3]),
            Err(DmxError::ChannelOverflow { first: 511, count: 3, max: 2 })
        ));
        assert!(matches!(buffer.update(&[0; 513]), Err(DmxError::ChannelOverflow { .. })));
    }

    #[test]
    fn test_snapshot_frame_truncation() {
        let buffer = ChannelBuffer::new();
        buffer.update(&[7; 512]).unwrap();
        let snapshot = buffer.snapshot();

        assert_eq!(snapshot.frame(10).len(), 11);
        assert_eq!(snapshot.frame(10)[0], DMX_START_CODE);
        assert_eq!(snapshot.frame(512).len(), DMX_FRAME_LEN);
        assert_eq!(snapshot.frame(4096).len(), DMX_FRAME_LEN);
    }

    #[test]
    fn test_blackout() {
        let buffer = ChannelBuffer::new();
        buffer.update(&[200; 512]).unwrap();
        buffer.blackout();

        assert!(buffer.snapshot().channels().iter().all(|&v| v == 0));
    }

    #[test]
    fn test_format_channels() {
        let text = format_channels(&[0xAB; 20]);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("001: {}", "ab".repeat(16)));
        assert_eq!(lines[1], "017: abababab");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_concurrent_snapshots_never_tear(
            fills in prop::collection::vec(1u8..=255, 1..40),
            readers in 1usize..4,
            reads_per_reader in 10usize..200,
        ) {
            let buffer = Arc::new(ChannelBuffer::new());
            let mut accepted = fills.clone();
            accepted.push(0);

            let writer = {
                let buffer = Arc::clone(&buffer);
                let fills = fills.clone();
                thread::spawn(move || {
                    for value in fills {
                        buffer.update(&[value; DMX_CHANNELS]).unwrap();
                        thread::yield_now();
                    }
                })
            };

            let reader_handles: Vec<_> = (0..readers)
                .map(|_| {
                    let buffer = Arc::clone(&buffer);
                    thread::spawn(move || {
                        (0..reads_per_reader)
                            .map(|_| {
                                let snapshot = buffer.snapshot();
                                thread::yield_now();
                                snapshot
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            writer.join().unwrap();

            for handle in reader_handles {
                for snapshot in handle.join().unwrap() {
                    let first = snapshot.data[1];
                    prop_assert!(snapshot.channels().iter().all(|&v| v == first));
                    prop_assert!(accepted.contains(&first));
                    prop_assert_eq!(snapshot.data[0], DMX_START_CODE);
                }
            }
        }
    }
}
