//! Call stack capture.
//!
//! With the `debug` feature the raw instruction pointers of the calling
//! thread are walked with the `backtrace` crate; without it, capture yields
//! an empty stack so the rest of the heap is unaffected.

/// Capture up to `max_depth` return addresses, skipping the innermost
/// `skip` frames (the heap's own).
#[cfg(feature = "debug")]
pub fn capture_frames(skip: usize, max_depth: usize) -> Vec<usize> {
    let mut frames = Vec::with_capacity(max_depth.min(64));
    let mut seen = 0usize;
    ::backtrace::trace(|frame| {
        if seen >= skip {
            frames.push(frame.ip() as usize);
        }
        seen += 1;
        frames.len() < max_depth
    });
    frames
}

#[cfg(not(feature = "debug"))]
pub fn capture_frames(skip: usize, max_depth: usize) -> Vec<usize> {
    let _ = (skip, max_depth);
    Vec::new()
}

/// Render frames one per line as raw return addresses.
pub fn format_frames(frames: &[usize]) -> String {
    frames
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("    #{} {:#x}\n", i, ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_respects_depth() {
        let frames = capture_frames(0, 4);
        assert!(frames.len() <= 4);
    }

    #[cfg(feature = "debug")]
    #[test]
    fn test_capture_finds_frames() {
        assert!(!capture_frames(0, 16).is_empty());
    }

    #[test]
    fn test_format_frames_numbers_lines() {
        let text = format_frames(&[0x10, 0x20]);
        assert_eq!(text, "    #0 0x10\n    #1 0x20\n");
    }

    #[cfg(feature = "debug")]
    #[test]
    fn test_format_frames_stays_unsymbolized() {
        let frames = capture_frames(0, 4);
        let text = format_frames(&frames);
        assert_eq!(text.lines().count(), frames.len());
        assert!(!text.contains(" in "));
    }
}
