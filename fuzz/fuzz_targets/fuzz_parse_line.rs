//! Fuzz target for event stream line handling.
//!
//! Feeds arbitrary bytes through the line buffer in two chunks and
//! classifies every resulting line. Nothing here may panic.

#![no_main]

use event_replication::stream::{parse_line, LineBuffer, StreamLine};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&[u8], usize)| {
    let (bytes, split) = data;
    let split = split % (bytes.len() + 1);

    let mut buffer = LineBuffer::new();
    buffer.push(&bytes[..split]);
    buffer.push(&bytes[split..]);

    while let Some(line) = buffer.next_line() {
        assert!(!line.contains('\n'));
        if let StreamLine::Data(value) = parse_line(&line) {
            // A data value is always a suffix of its line.
            let line = line.strip_suffix('\r').unwrap_or(&line);
            assert!(line.ends_with(&value));
        }
    }

    let _ = buffer.overflowed();
    let tail = buffer.discard_partial();
    assert!(!bytes[bytes.len() - tail..].contains(&b'\n'));
    assert!(buffer.is_empty());
});
