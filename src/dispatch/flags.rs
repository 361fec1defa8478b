use std::fmt;

/// Reserved first arguments handled by the runtime itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFlag {
    Help,
    List,
    Link,
    PngIcon,
    SvgIcon,
    Desktop,
    AppStream,
    PortableHome,
    PortableConfig,
    Extract,
    AppImageExtract,
    ExtractAndRun,
    Mount,
    Offset,
    Cleanup,
}

const FLAGS: &[(&str, RuntimeFlag)] = &[
    ("--pbundle_help", RuntimeFlag::Help),
    ("--pbundle_list", RuntimeFlag::List),
    ("--pbundle_link", RuntimeFlag::Link),
    ("--pbundle_pngIcon", RuntimeFlag::PngIcon),
    ("--pbundle_svgIcon", RuntimeFlag::SvgIcon),
    ("--pbundle_desktop", RuntimeFlag::Desktop),
    ("--pbundle_appstream", RuntimeFlag::AppStream),
    ("--pbundle_portableHome", RuntimeFlag::PortableHome),
    ("--pbundle_portableConfig", RuntimeFlag::PortableConfig),
    ("--pbundle_extract", RuntimeFlag::Extract),
    ("--appimage-extract", RuntimeFlag::AppImageExtract),
    ("--pbundle_extract_and_run", RuntimeFlag::ExtractAndRun),
    ("--appimage-extract-and-run", RuntimeFlag::ExtractAndRun),
    ("--pbundle_mount", RuntimeFlag::Mount),
    ("--appimage-mount", RuntimeFlag::Mount),
    ("--pbundle_offset", RuntimeFlag::Offset),
    ("--appimage-offset", RuntimeFlag::Offset),
    ("--pbundle_cleanup", RuntimeFlag::Cleanup),
];

/// Internal flag used to re-invoke the bundle as the detached cleanup process.
pub const INTERNAL_CLEANUP_FLAG: &str = "--pbundle_internal_Cleanup";

impl RuntimeFlag {
    /// Recognise a reserved flag. Anything else belongs to the entrypoint.
    pub fn parse(arg: &str) -> Option<Self> {
        FLAGS
            .iter()
            .find(|(name, _)| *name == arg)
            .map(|(_, flag)| *flag)
    }

    /// Canonical spelling.
    pub fn name(self) -> &'static str {
        FLAGS
            .iter()
            .find(|(_, flag)| *flag == self)
            .map(|(name, _)| *name)
            .unwrap_or("--pbundle_help")
    }
}

impl fmt::Display for RuntimeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
