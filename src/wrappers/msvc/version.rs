use std::fmt;

/// Four-part tool version with a total lexicographic order.
///
/// Mirrors the packed form used by the VC toolset: sixteen bits per
/// component, major in the most significant position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u16,
    minor: u16,
    build: u16,
    qfe: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, build: u16, qfe: u16) -> Self {
        Self {
            major,
            minor,
            build,
            qfe,
        }
    }

    pub fn from_packed(value: u64) -> Self {
        Self {
            major: (value >> 48) as u16,
            minor: (value >> 32) as u16,
            build: (value >> 16) as u16,
            qfe: value as u16,
        }
    }

    pub fn as_packed(&self) -> u64 {
        ((self.major as u64) << 48)
            | ((self.minor as u64) << 32)
            | ((self.build as u64) << 16)
            | self.qfe as u64
    }

    /// Parses a dotted-decimal version string. Missing components default
    /// to zero; components past the fourth are ignored.
    pub fn parse(text: &str) -> Self {
        let mut parts = [0u16; 4];
        for (slot, piece) in parts.iter_mut().zip(text.split('.')) {
            *slot = leading_number(piece.trim());
        }
        Self::new(parts[0], parts[1], parts[2], parts[3])
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    /// Formats the first `components` dotted components.
    pub fn as_string(&self, components: usize) -> String {
        let parts = [self.major, self.minor, self.build, self.qfe];
        parts[..components.min(parts.len())]
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string(4))
    }
}

fn leading_number(text: &str) -> u16 {
    let digits: &str = &text[..text.bytes().take_while(u8::is_ascii_digit).count()];
    digits.parse::<u32>().map(|v| v as u16).unwrap_or(0)
}

/// Identity of one compiler binary: architectures plus toolset version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolVersion {
    pub host_arch: String,
    pub target_arch: String,
    pub vc_version: Version,
}
