//! Incremental JSON object extraction from the child's stdout.
//!
//! The CLI emits newline-delimited JSON most of the time but occasionally
//! concatenates objects into one write, so line splitting corrupts the
//! stream. Instead we scan bytes with brace-depth tracking (string- and
//! escape-aware) and emit every complete top-level object, keeping any
//! incomplete trailing data buffered for the next chunk.

use serde_json::Value;

#[derive(Default)]
pub struct ObjectParser {
    buf: Vec<u8>,
}

impl ObjectParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete object it finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let (objects, consumed) = extract_objects(&self.buf);
        self.buf.drain(..consumed);
        objects
    }

    /// Bytes still waiting for their closing brace.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Scan `buf` for complete top-level JSON objects. Returns the parsed
/// objects and the number of bytes consumed (up to the end of the last
/// complete object). Slices that fail to parse are discarded silently.
fn extract_objects(buf: &[u8]) -> (Vec<Value>, usize) {
    let mut objects = Vec::new();
    let mut consumed = 0usize;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut start = 0usize;

    for (i, &b) in buf.iter().enumerate() {
        if depth == 0 {
            // Between objects: skip until an opening brace. A stray `}`
            // here is ignored without advancing the start pointer.
            if b == b'{' {
                start = i;
                depth = 1;
            }
            continue;
        }

        if in_string {
            if escape_next {
                escape_next = false;
            } else if b == b'\\' {
                escape_next = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    if let Ok(v) = serde_json::from_slice(&buf[start..=i]) {
                        objects.push(v);
                    }
                    consumed = i + 1;
                }
            }
            _ => {}
        }
    }

    (objects, consumed)
}
