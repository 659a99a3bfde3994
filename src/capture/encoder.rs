//! Encoder selection and the packet types the pipeline emits.
//!
//! The encoder backends themselves are platform drivers behind the
//! [`EncoderProbe`] contract; the host owns the closed variant set, the
//! probe order, and the packet shapes that travel to the transport and the
//! WebRTC fan-out.

use bytes::Bytes;

/// Environment switch that enables real encoder validation probes.
pub const RUN_ENCODER_TESTS_ENV: &str = "SUNSHINE_RUN_ENCODER_TESTS";

/// The closed set of encoder backends, in probe priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Nvenc,
    Amd,
    QuickSync,
    VaApi,
    VideoToolbox,
    Software,
}

impl EncoderKind {
    pub const PROBE_ORDER: [EncoderKind; 6] = [
        EncoderKind::Nvenc,
        EncoderKind::Amd,
        EncoderKind::QuickSync,
        EncoderKind::VaApi,
        EncoderKind::VideoToolbox,
        EncoderKind::Software,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EncoderKind::Nvenc => "nvenc",
            EncoderKind::Amd => "amdvce",
            EncoderKind::QuickSync => "quicksync",
            EncoderKind::VaApi => "vaapi",
            EncoderKind::VideoToolbox => "videotoolbox",
            EncoderKind::Software => "software",
        }
    }
}

/// Platform-side probe: can this backend produce a valid stream right now?
/// Software is the guaranteed fallback and is never asked.
pub trait EncoderProbe: Send + Sync {
    fn validate(&self, kind: EncoderKind) -> bool;
}

/// Probe used when hardware validation is unavailable or disabled.
pub struct NoHardwareProbe;

impl EncoderProbe for NoHardwareProbe {
    fn validate(&self, _kind: EncoderKind) -> bool {
        false
    }
}

/// A selected encoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoder {
    pub kind: EncoderKind,
}

/// Probe the backends in priority order and return the first that
/// validates. Hardware probes only run when `SUNSHINE_RUN_ENCODER_TESTS`
/// is set; otherwise selection falls straight through to software.
pub fn select_encoder(probe: &dyn EncoderProbe) -> Encoder {
    let probing_enabled = std::env::var(RUN_ENCODER_TESTS_ENV).is_ok();

    for kind in EncoderKind::PROBE_ORDER {
        if kind == EncoderKind::Software {
            return Encoder { kind };
        }
        if probing_enabled && probe.validate(kind) {
            tracing::info!("Selected {} encoder", kind.name());
            return Encoder { kind };
        }
    }
    Encoder {
        kind: EncoderKind::Software,
    }
}

/// Byte sequence spliced into IDR frames on delivery (e.g. SPS/VUI fixups
/// the encoder cannot emit itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteReplacement {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// One encoded video access unit as emitted by the encoder.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    /// Shared, reference-counted payload
    pub data: Bytes,
    pub frame_index: u64,
    pub is_idr: bool,
    pub after_ref_invalidation: bool,
    pub timestamp_qpc: u64,
    pub replacements: Vec<ByteReplacement>,
}

impl VideoPacket {
    /// Payload as delivered to consumers: IDR frames get the replacement
    /// sequences spliced in, everything else ships as-is.
    pub fn delivery_bytes(&self) -> Bytes {
        if !self.is_idr || self.replacements.is_empty() {
            return self.data.clone();
        }
        let mut out = self.data.to_vec();
        for replacement in &self.replacements {
            out = splice(&out, &replacement.old, &replacement.new);
        }
        Bytes::from(out)
    }
}

/// One encoded audio frame.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Bytes,
    pub timestamp: u64,
}

/// Replace every occurrence of `old` with `new`.
fn splice(data: &[u8], old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.is_empty() || data.len() < old.len() {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i..].starts_with(old) {
            out.extend_from_slice(new);
            i += old.len();
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(Vec<EncoderKind>);

    impl EncoderProbe for FixedProbe {
        fn validate(&self, kind: EncoderKind) -> bool {
            self.0.contains(&kind)
        }
    }

    fn packet(data: &[u8], is_idr: bool, replacements: Vec<ByteReplacement>) -> VideoPacket {
        VideoPacket {
            data: Bytes::copy_from_slice(data),
            frame_index: 0,
            is_idr,
            after_ref_invalidation: false,
            timestamp_qpc: 0,
            replacements,
        }
    }

    #[test]
    fn software_is_the_fallback_without_probing() {
        std::env::remove_var(RUN_ENCODER_TESTS_ENV);
        let selected = select_encoder(&FixedProbe(vec![EncoderKind::Nvenc]));
        assert_eq!(selected.kind, EncoderKind::Software);
    }

    #[test]
    fn probe_order_is_priority_order() {
        assert_eq!(EncoderKind::PROBE_ORDER[0], EncoderKind::Nvenc);
        assert_eq!(
            EncoderKind::PROBE_ORDER[EncoderKind::PROBE_ORDER.len() - 1],
            EncoderKind::Software
        );
    }

    #[test]
    fn idr_replacements_spliced_on_delivery() {
        let p = packet(
            b"\x00\x00\x01OLD\x00\x00\x01",
            true,
            vec![ByteReplacement {
                old: b"OLD".to_vec(),
                new: b"NEWER".to_vec(),
            }],
        );
        assert_eq!(&p.delivery_bytes()[..], b"\x00\x00\x01NEWER\x00\x00\x01");
    }

    #[test]
    fn non_idr_frames_ship_untouched() {
        let p = packet(
            b"OLD",
            false,
            vec![ByteReplacement {
                old: b"OLD".to_vec(),
                new: b"NEW".to_vec(),
            }],
        );
        assert_eq!(&p.delivery_bytes()[..], b"OLD");
    }

    #[test]
    fn splice_handles_multiple_and_absent_matches() {
        assert_eq!(splice(b"abcabc", b"abc", b"x"), b"xx");
        assert_eq!(splice(b"abc", b"zzz", b"x"), b"abc");
        assert_eq!(splice(b"ab", b"abc", b"x"), b"ab");
    }
}
