//! Bitrate shaping for session descriptions.
//!
//! Offers and answers are patched on their way to the wire: every audio and
//! video codec payload gets explicit min/max bitrate parameters on its fmtp
//! line. Payloads that already carry bounds are left untouched, which makes
//! the patch idempotent. Repair/auxiliary payloads (rtx, fec, comfort noise,
//! DTMF) are skipped.

/// Bitrate bounds injected into codec parameter lines, in kbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateBounds {
    pub min_kbps: u32,
    pub max_kbps: u32,
}

const MIN_KEY: &str = "x-google-min-bitrate";
const MAX_KEY: &str = "x-google-max-bitrate";

/// Codecs that must not be bitrate-bounded.
const SKIPPED_CODECS: [&str; 6] = ["rtx", "red", "ulpfec", "flexfec-03", "cn", "telephone-event"];

#[derive(Clone, Copy, PartialEq)]
enum MediaKind {
    Audio,
    Video,
    Other,
}

/// Rewrites codec fmtp lines in `sdp` to carry min/max bitrate bounds.
///
/// Idempotent: payloads whose fmtp already names a bitrate bound are left
/// exactly as they are, so applying the patch twice equals applying it once.
pub fn apply_bitrate_bounds(sdp: &str, audio: &BitrateBounds, video: &BitrateBounds) -> String {
    let crlf = sdp.contains("\r\n");
    let lines: Vec<&str> = sdp.split('\n').map(|l| l.trim_end_matches('\r')).collect();

    // First pass: which payloads belong to which media section, and which
    // already have an fmtp line.
    let mut kind = MediaKind::Other;
    let mut payload_kind: Vec<(String, MediaKind, String)> = Vec::new(); // (pt, kind, codec)
    let mut has_fmtp: Vec<String> = Vec::new();
    for line in &lines {
        if let Some(rest) = line.strip_prefix("m=") {
            kind = match rest.split(' ').next() {
                Some("audio") => MediaKind::Audio,
                Some("video") => MediaKind::Video,
                _ => MediaKind::Other,
            };
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            let mut parts = rest.splitn(2, ' ');
            if let (Some(pt), Some(codec)) = (parts.next(), parts.next()) {
                let codec_name = codec.split('/').next().unwrap_or("").to_ascii_lowercase();
                payload_kind.push((pt.to_string(), kind, codec_name));
            }
        } else if let Some(rest) = line.strip_prefix("a=fmtp:") {
            if let Some(pt) = rest.split(' ').next() {
                has_fmtp.push(pt.to_string());
            }
        }
    }

    let bounds_for = |pt: &str| -> Option<&BitrateBounds> {
        let (_, kind, codec) = payload_kind.iter().find(|(p, _, _)| p == pt)?;
        if SKIPPED_CODECS.contains(&codec.as_str()) {
            return None;
        }
        match kind {
            MediaKind::Audio => Some(audio),
            MediaKind::Video => Some(video),
            MediaKind::Other => None,
        }
    };

    // Second pass: patch existing fmtp lines, synthesize missing ones right
    // after the payload's rtpmap line.
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 8);
    for line in &lines {
        if let Some(rest) = line.strip_prefix("a=fmtp:") {
            let mut parts = rest.splitn(2, ' ');
            let pt = parts.next().unwrap_or("");
            let params = parts.next().unwrap_or("");
            if let Some(bounds) = bounds_for(pt) {
                if params.contains(MIN_KEY) || params.contains(MAX_KEY) {
                    out.push(line.to_string());
                } else {
                    out.push(format!(
                        "a=fmtp:{pt} {params};{MIN_KEY}={};{MAX_KEY}={}",
                        bounds.min_kbps, bounds.max_kbps
                    ));
                }
                continue;
            }
            out.push(line.to_string());
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            out.push(line.to_string());
            let pt = rest.split(' ').next().unwrap_or("");
            if !has_fmtp.iter().any(|p| p == pt)
                && let Some(bounds) = bounds_for(pt)
            {
                out.push(format!(
                    "a=fmtp:{pt} {MIN_KEY}={};{MAX_KEY}={}",
                    bounds.min_kbps, bounds.max_kbps
                ));
            }
        } else {
            out.push(line.to_string());
        }
    }

    let sep = if crlf { "\r\n" } else { "\n" };
    out.join(sep)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\n\
        o=- 46117317 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 110\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:110 telephone-event/48000\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=rtpmap:96 VP8/90000\r\n\
        a=rtpmap:97 rtx/90000\r\n\
        a=fmtp:97 apt=96\r\n";

    fn bounds() -> (BitrateBounds, BitrateBounds) {
        (
            BitrateBounds {
                min_kbps: 32,
                max_kbps: 96,
            },
            BitrateBounds {
                min_kbps: 300,
                max_kbps: 2500,
            },
        )
    }

    #[test]
    fn test_bounds_injected_per_section() {
        let (audio, video) = bounds();
        let patched = apply_bitrate_bounds(SDP, &audio, &video);

        assert!(patched.contains(
            "a=fmtp:111 minptime=10;useinbandfec=1;x-google-min-bitrate=32;x-google-max-bitrate=96"
        ));
        // VP8 had no fmtp line; one is synthesized after its rtpmap.
        assert!(patched.contains("a=fmtp:96 x-google-min-bitrate=300;x-google-max-bitrate=2500"));
    }

    #[test]
    fn test_auxiliary_payloads_untouched() {
        let (audio, video) = bounds();
        let patched = apply_bitrate_bounds(SDP, &audio, &video);

        assert!(patched.contains("a=fmtp:97 apt=96\r\n"));
        assert!(!patched.contains("a=fmtp:110"));
    }

    #[test]
    fn test_idempotent() {
        let (audio, video) = bounds();
        let once = apply_bitrate_bounds(SDP, &audio, &video);
        let twice = apply_bitrate_bounds(&once, &audio, &video);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_existing_bounds_left_untouched() {
        let sdp = "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
            a=rtpmap:111 opus/48000/2\r\n\
            a=fmtp:111 x-google-min-bitrate=8;x-google-max-bitrate=16\r\n";
        let (audio, video) = bounds();
        let patched = apply_bitrate_bounds(sdp, &audio, &video);
        assert!(patched.contains("a=fmtp:111 x-google-min-bitrate=8;x-google-max-bitrate=16"));
        assert!(!patched.contains("x-google-max-bitrate=96"));
    }

    #[test]
    fn test_non_media_lines_preserved() {
        let (audio, video) = bounds();
        let patched = apply_bitrate_bounds(SDP, &audio, &video);
        assert!(patched.starts_with("v=0\r\no=- 46117317 2 IN IP4 127.0.0.1"));
        assert!(patched.contains("c=IN IP4 0.0.0.0"));
    }
}
