/// Host platform detection and the bundle table keyed by it.
///
/// The table is the single place that knows which download exists for which
/// OS/architecture pair; pairs missing from it are unsupported.
use std::fmt;

use relayfetch_shared::errors::DependencyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    Macos,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostArch {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

impl HostOs {
    pub const ALL: [HostOs; 3] = [HostOs::Windows, HostOs::Macos, HostOs::Linux];

    fn parse(os: &str) -> Option<Self> {
        match os {
            "windows" => Some(HostOs::Windows),
            "macos" => Some(HostOs::Macos),
            "linux" => Some(HostOs::Linux),
            _ => None,
        }
    }
}

impl HostArch {
    pub const ALL: [HostArch; 4] = [HostArch::X86, HostArch::X86_64, HostArch::Arm, HostArch::Aarch64];

    fn parse(arch: &str) -> Option<Self> {
        match arch {
            "x86" | "i386" | "i686" => Some(HostArch::X86),
            "x86_64" | "amd64" => Some(HostArch::X86_64),
            "arm" | "armv7" | "armv7l" => Some(HostArch::Arm),
            "aarch64" | "arm64" => Some(HostArch::Aarch64),
            _ => None,
        }
    }
}

/// Tor expert bundle name parts: (os, arch, os handle, arch handle).
/// Windows on ARM runs the x86_64 build under emulation.
const TOR_BUNDLES: &[(HostOs, HostArch, &str, &str)] = &[
    (HostOs::Windows, HostArch::X86_64, "windows", "x86_64"),
    (HostOs::Windows, HostArch::Aarch64, "windows", "x86_64"),
    (HostOs::Windows, HostArch::X86, "windows", "i686"),
    (HostOs::Macos, HostArch::Aarch64, "macos", "aarch64"),
    (HostOs::Macos, HostArch::X86_64, "macos", "x86_64"),
    (HostOs::Linux, HostArch::X86_64, "linux", "x86_64"),
    (HostOs::Linux, HostArch::X86, "linux", "i686"),
    (HostOs::Linux, HostArch::Aarch64, "linux", "aarch64"),
    (HostOs::Linux, HostArch::Arm, "linux", "armv7"),
];

/// Portable ffmpeg archive (7z) for hosts that usually lack a system ffmpeg.
const CODEC_BUNDLES: &[(HostOs, &str)] = &[(
    HostOs::Windows,
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-git-essentials.7z",
)];

/// Portable single-file 7-Zip.
const CONVERTER_BUNDLES: &[(HostOs, &str)] = &[(HostOs::Windows, "https://www.7-zip.org/a/7zr.exe")];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: HostOs,
    pub arch: HostArch,
}

impl Platform {
    pub fn new(os: HostOs, arch: HostArch) -> Self {
        Self { os, arch }
    }

    /// The platform this binary was compiled for.
    pub fn current() -> Result<Self, DependencyError> {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_names(os: &str, arch: &str) -> Result<Self, DependencyError> {
        let unsupported = || DependencyError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let os = HostOs::parse(&os.to_lowercase()).ok_or_else(unsupported)?;
        let arch = HostArch::parse(&arch.to_lowercase()).ok_or_else(unsupported)?;
        Ok(Self { os, arch })
    }

    fn unsupported(&self) -> DependencyError {
        DependencyError::UnsupportedPlatform {
            os: format!("{:?}", self.os).to_lowercase(),
            arch: format!("{:?}", self.arch).to_lowercase(),
        }
    }

    /// `(os, arch)` handles used in Tor expert bundle file names.
    pub fn tor_bundle_handles(&self) -> Result<(&'static str, &'static str), DependencyError> {
        TOR_BUNDLES
            .iter()
            .find(|(os, arch, _, _)| *os == self.os && *arch == self.arch)
            .map(|(_, _, os, arch)| (*os, *arch))
            .ok_or_else(|| self.unsupported())
    }

    pub fn codec_bundle_url(&self) -> Result<&'static str, DependencyError> {
        CODEC_BUNDLES
            .iter()
            .find(|(os, _)| *os == self.os)
            .map(|(_, url)| *url)
            .ok_or_else(|| self.unsupported())
    }

    pub fn converter_url(&self) -> Result<&'static str, DependencyError> {
        CONVERTER_BUNDLES
            .iter()
            .find(|(os, _)| *os == self.os)
            .map(|(_, url)| *url)
            .ok_or_else(|| self.unsupported())
    }

    /// `name` with the platform's executable suffix.
    pub fn executable(&self, name: &str) -> String {
        match self.os {
            HostOs::Windows => format!("{}.exe", name),
            _ => name.to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.os, self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names() {
        let p = Platform::from_names("linux", "aarch64").unwrap();
        assert_eq!(p, Platform::new(HostOs::Linux, HostArch::Aarch64));
        assert!(matches!(
            Platform::from_names("freebsd", "x86_64"),
            Err(DependencyError::UnsupportedPlatform { .. })
        ));
        assert!(Platform::from_names("linux", "riscv64").is_err());
    }

    #[test]
    fn test_tor_handles() {
        let linux_arm = Platform::new(HostOs::Linux, HostArch::Arm);
        assert_eq!(linux_arm.tor_bundle_handles().unwrap(), ("linux", "armv7"));
        let mac = Platform::new(HostOs::Macos, HostArch::Aarch64);
        assert_eq!(mac.tor_bundle_handles().unwrap(), ("macos", "aarch64"));
        let win32 = Platform::new(HostOs::Windows, HostArch::X86);
        assert_eq!(win32.tor_bundle_handles().unwrap(), ("windows", "i686"));
    }

    #[test]
    fn test_table_covers_enumerated_platforms() {
        let mut supported = 0;
        for os in HostOs::ALL {
            for arch in HostArch::ALL {
                let platform = Platform::new(os, arch);
                match platform.tor_bundle_handles() {
                    Ok(_) => supported += 1,
                    Err(DependencyError::UnsupportedPlatform { .. }) => {}
                    Err(e) => panic!("unexpected error for {}: {}", platform, e),
                }
            }
        }
        // 32-bit macOS and 32-bit ARM Windows have no bundle.
        assert_eq!(supported, TOR_BUNDLES.len());
        assert_eq!(supported, 12 - 3);
        assert!(Platform::new(HostOs::Macos, HostArch::Arm).tor_bundle_handles().is_err());
    }

    #[test]
    fn test_windows_only_portables() {
        let win = Platform::new(HostOs::Windows, HostArch::X86_64);
        assert!(win.codec_bundle_url().unwrap().ends_with(".7z"));
        assert!(win.converter_url().unwrap().ends_with("7zr.exe"));
        assert_eq!(win.executable("tor"), "tor.exe");

        let linux = Platform::new(HostOs::Linux, HostArch::X86_64);
        assert!(linux.codec_bundle_url().is_err());
        assert!(linux.converter_url().is_err());
        assert_eq!(linux.executable("tor"), "tor");
    }
}
