use tracing::warn;

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Default scratch cap: twice the pool slot size. A stream that never yields
/// an EOI within this window resets the parser instead of growing forever.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * crate::pool::DEFAULT_SLOT_SIZE;

/// Stateful MJPEG byte machine.
///
/// Fed arbitrary chunks of an upstream body, emits one complete JPEG (SOI
/// through EOI inclusive) per EOI found. Multipart boundaries and headers
/// between frames are skipped without being parsed: anything outside
/// SOI..EOI is discarded.
pub struct MjpegParser {
    buf: Vec<u8>,
    /// Resume point for the EOI scan so repeated feeds stay linear
    scan_pos: usize,
    max_frame_bytes: usize,
    frames_parsed: u64,
    overflows: u64,
}

impl MjpegParser {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            scan_pos: 0,
            max_frame_bytes,
            frames_parsed: 0,
            overflows: 0,
        }
    }

    /// Feed a chunk, invoking `emit` once per completed frame
    pub fn feed<F: FnMut(&[u8])>(&mut self, chunk: &[u8], mut emit: F) {
        self.buf.extend_from_slice(chunk);

        loop {
            let Some(start) = find_marker(&self.buf, SOI) else {
                // No frame start anywhere; keep a trailing 0xFF in case the
                // marker is split across chunks
                if self.buf.last() == Some(&0xFF) {
                    let tail = self.buf.len() - 1;
                    self.buf.drain(..tail);
                } else {
                    self.buf.clear();
                }
                self.scan_pos = 0;
                return;
            };

            if start > 0 {
                self.buf.drain(..start);
                self.scan_pos = 0;
            }

            let scan_from = self.scan_pos.max(2);
            match find_marker(&self.buf[scan_from - 1..], EOI) {
                Some(rel) => {
                    let end = scan_from - 1 + rel + 2;
                    emit(&self.buf[..end]);
                    self.frames_parsed += 1;
                    self.buf.drain(..end);
                    self.scan_pos = 0;
                }
                None => {
                    if self.buf.len() > self.max_frame_bytes {
                        self.overflows += 1;
                        warn!(
                            "MJPEG parser overflow: {} bytes without EOI, resetting",
                            self.buf.len()
                        );
                        self.buf.clear();
                        self.scan_pos = 0;
                    } else {
                        // Remember where the scan stopped; the marker may be
                        // split, so back off one byte
                        self.scan_pos = self.buf.len().max(2);
                    }
                    return;
                }
            }
        }
    }

    /// Discard all buffered state
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan_pos = 0;
    }

    /// Total complete frames emitted
    pub fn frames_parsed(&self) -> u64 {
        self.frames_parsed
    }

    /// Times the scratch buffer overflowed and was reset
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Bytes currently buffered awaiting a frame boundary
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2]) -> Option<usize> {
    haystack
        .windows(2)
        .position(|pair| pair[0] == marker[0] && pair[1] == marker[1])
}
