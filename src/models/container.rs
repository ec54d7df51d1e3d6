//! Container kinds, their partition layouts, and the components they decompose into.
//!
//! Two container kinds are supported:
//! - [`ContainerKind::Cia`] (`.cia`): up to three content partitions (0, 1, 2); rebuilt
//!   with an explicit title version.
//! - [`ContainerKind::Cci`] (`.3ds`): up to five NCSD partitions (0, 1, 2, 6, 7); the
//!   title version is not part of the rebuild.
//!
//! Every decoded file in a workspace is a [`Component`] with a fixed "original" name
//! (as written by extraction) and a "Custom"-prefixed counterpart (written by staging,
//! overwritten by patching, consumed by rebuilding).

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported container file kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// CTR Importable Archive (`.cia`)
    Cia,
    /// CTR Cart Image (`.3ds`)
    Cci,
}

impl ContainerKind {
    /// All supported kinds, in the order automatic mapping visits them
    pub const ALL: [ContainerKind; 2] = [ContainerKind::Cia, ContainerKind::Cci];

    /// File extension (without dot, lowercase)
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::Cia => "cia",
            ContainerKind::Cci => "3ds",
        }
    }

    /// Determine the kind from a file name, ignoring extension case.
    pub fn from_path(path: impl AsRef<Utf8Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?;
        Self::ALL
            .into_iter()
            .find(|kind| ext.eq_ignore_ascii_case(kind.extension()))
    }

    /// Partition slots this kind can carry
    pub fn partition_slots(self) -> &'static [PartitionSlot] {
        match self {
            ContainerKind::Cia => &CIA_SLOTS,
            ContainerKind::Cci => &CCI_SLOTS,
        }
    }

    /// Whether the rebuilt container records the mapping version
    pub fn uses_version(self) -> bool {
        matches!(self, ContainerKind::Cia)
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Cia => write!(f, "CIA"),
            ContainerKind::Cci => write!(f, "3DS"),
        }
    }
}

/// How a partition is split into components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionFormat {
    /// Executable partition: header, extended header, ExeFS, RomFS, logo, plain region
    Cxi,
    /// Data-only partition: header and RomFS
    Cfa,
    /// Kept as a single opaque file
    Raw,
}

/// A partition slot and the components it is made of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSlot {
    pub index: u8,
    pub format: PartitionFormat,
    /// Component names that make up this partition, header first
    pub components: &'static [&'static str],
}

impl PartitionSlot {
    /// Name of the decrypted partition file produced by the first extraction step
    pub fn decrypted_file(&self) -> String {
        format!("DecryptedPartition{}.bin", self.index)
    }

    /// Name of the partition file assembled during rebuild
    pub fn custom_file(&self) -> String {
        format!("CustomPartition{}.bin", self.index)
    }
}

const CXI_COMPONENTS: &[&str] = &[
    component::HEADER0,
    component::EX_HEADER,
    component::EXEFS_IMAGE,
    component::ROMFS,
    component::LOGO,
    component::PLAIN,
];

const CIA_SLOTS: [PartitionSlot; 3] = [
    PartitionSlot {
        index: 0,
        format: PartitionFormat::Cxi,
        components: CXI_COMPONENTS,
    },
    PartitionSlot {
        index: 1,
        format: PartitionFormat::Cfa,
        components: &[component::HEADER1, component::MANUAL],
    },
    PartitionSlot {
        index: 2,
        format: PartitionFormat::Cfa,
        components: &[component::HEADER2, component::DOWNLOAD_PLAY],
    },
];

const CCI_SLOTS: [PartitionSlot; 5] = [
    CIA_SLOTS[0],
    CIA_SLOTS[1],
    CIA_SLOTS[2],
    PartitionSlot {
        index: 6,
        format: PartitionFormat::Raw,
        components: &[component::UPDATE_N3DS],
    },
    PartitionSlot {
        index: 7,
        format: PartitionFormat::Raw,
        components: &[component::UPDATE_O3DS],
    },
];

/// Component names
pub mod component {
    pub const EXEFS_DIR: &str = "exefs_dir";
    pub const EXEFS_HEADER: &str = "exefs_header";
    pub const EXEFS_IMAGE: &str = "exefs";
    pub const EX_HEADER: &str = "ex_header";
    pub const ROMFS: &str = "romfs";
    pub const HEADER0: &str = "header0";
    pub const LOGO: &str = "logo";
    pub const PLAIN: &str = "plain";
    pub const MANUAL: &str = "manual";
    pub const HEADER1: &str = "header1";
    pub const DOWNLOAD_PLAY: &str = "download_play";
    pub const HEADER2: &str = "header2";
    pub const NCSD_HEADER: &str = "ncsd_header";
    pub const UPDATE_N3DS: &str = "update_n3ds";
    pub const UPDATE_O3DS: &str = "update_o3ds";
}

/// A named file (or directory) inside a workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component {
    pub name: &'static str,
    /// Name written by extraction
    pub original: &'static str,
    /// "Custom" counterpart written by staging and consumed by rebuild
    pub custom: &'static str,
    pub is_dir: bool,
}

const fn file(name: &'static str, original: &'static str, custom: &'static str) -> Component {
    Component {
        name,
        original,
        custom,
        is_dir: false,
    }
}

/// Every component any container kind can decompose into
pub const COMPONENTS: &[Component] = &[
    Component {
        name: component::EXEFS_DIR,
        original: "ExtractedExeFS",
        custom: "CustomExeFS",
        is_dir: true,
    },
    file(component::EXEFS_HEADER, "HeaderExeFS.bin", "CustomHeaderExeFS.bin"),
    file(component::EXEFS_IMAGE, "DecryptedExeFS.bin", "CustomExeFS.bin"),
    file(component::EX_HEADER, "DecryptedExHeader.bin", "CustomExHeader.bin"),
    file(component::ROMFS, "DecryptedRomFS.bin", "CustomRomFS.bin"),
    file(component::HEADER0, "HeaderNCCH0.bin", "CustomHeaderNCCH0.bin"),
    file(component::LOGO, "LogoLZ.bin", "CustomLogoLZ.bin"),
    file(component::PLAIN, "PlainRGN.bin", "CustomPlainRGN.bin"),
    file(component::MANUAL, "DecryptedManual.bin", "CustomManual.bin"),
    file(component::HEADER1, "HeaderNCCH1.bin", "CustomHeaderNCCH1.bin"),
    file(
        component::DOWNLOAD_PLAY,
        "DecryptedDownloadPlay.bin",
        "CustomDownloadPlay.bin",
    ),
    file(component::HEADER2, "HeaderNCCH2.bin", "CustomHeaderNCCH2.bin"),
    file(component::NCSD_HEADER, "HeaderNCSD.bin", "CustomHeaderNCSD.bin"),
    file(
        component::UPDATE_N3DS,
        "DecryptedPartition6.bin",
        "CustomPartition6.bin",
    ),
    file(
        component::UPDATE_O3DS,
        "DecryptedPartition7.bin",
        "CustomPartition7.bin",
    ),
];

/// Look up a component by name
pub fn find_component(name: &str) -> Option<&'static Component> {
    COMPONENTS.iter().find(|c| c.name == name)
}

/// Something a patch archive entry can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchTarget {
    Romfs,
    Manual,
    DownloadPlay,
    Banner,
    Code,
    Icon,
    Logo,
    Plain,
    ExHeader,
    Header0,
    Header1,
    Header2,
}

impl PatchTarget {
    pub const ALL: [PatchTarget; 12] = [
        PatchTarget::Romfs,
        PatchTarget::Manual,
        PatchTarget::DownloadPlay,
        PatchTarget::Banner,
        PatchTarget::Code,
        PatchTarget::Icon,
        PatchTarget::Logo,
        PatchTarget::Plain,
        PatchTarget::ExHeader,
        PatchTarget::Header0,
        PatchTarget::Header1,
        PatchTarget::Header2,
    ];

    /// Patch entry name used when the configuration does not override it
    pub fn default_entry_name(self) -> &'static str {
        match self {
            PatchTarget::Romfs => "RomFS.xdelta",
            PatchTarget::Manual => "Manual.xdelta",
            PatchTarget::DownloadPlay => "DownloadPlay.xdelta",
            PatchTarget::Banner => "banner.xdelta",
            PatchTarget::Code => "code.xdelta",
            PatchTarget::Icon => "icon.xdelta",
            PatchTarget::Logo => "LogoLZ.xdelta",
            PatchTarget::Plain => "PlainRGN.xdelta",
            PatchTarget::ExHeader => "ExHeader.xdelta",
            PatchTarget::Header0 => "HeaderNCCH0.xdelta",
            PatchTarget::Header1 => "HeaderNCCH1.xdelta",
            PatchTarget::Header2 => "HeaderNCCH2.xdelta",
        }
    }

    /// Name used for this target in settings and on the command line
    pub fn key(self) -> &'static str {
        match self {
            PatchTarget::Romfs => "romfs",
            PatchTarget::Manual => "manual",
            PatchTarget::DownloadPlay => "download_play",
            PatchTarget::Banner => "banner",
            PatchTarget::Code => "code",
            PatchTarget::Icon => "icon",
            PatchTarget::Logo => "logo",
            PatchTarget::Plain => "plain",
            PatchTarget::ExHeader => "ex_header",
            PatchTarget::Header0 => "header0",
            PatchTarget::Header1 => "header1",
            PatchTarget::Header2 => "header2",
        }
    }

    /// `(original, custom)` paths relative to a mapping workspace
    pub fn paths(self) -> (String, String) {
        let exefs = |name: &str| {
            (
                format!("ExtractedExeFS/{}", name),
                format!("CustomExeFS/{}", name),
            )
        };
        let whole = |name: &str| {
            let c = find_component(name).unwrap_or(&COMPONENTS[0]);
            (c.original.to_string(), c.custom.to_string())
        };

        match self {
            PatchTarget::Banner => exefs("banner.bin"),
            PatchTarget::Code => exefs("code.bin"),
            PatchTarget::Icon => exefs("icon.bin"),
            PatchTarget::Romfs => whole(component::ROMFS),
            PatchTarget::Manual => whole(component::MANUAL),
            PatchTarget::DownloadPlay => whole(component::DOWNLOAD_PLAY),
            PatchTarget::Logo => whole(component::LOGO),
            PatchTarget::Plain => whole(component::PLAIN),
            PatchTarget::ExHeader => whole(component::EX_HEADER),
            PatchTarget::Header0 => whole(component::HEADER0),
            PatchTarget::Header1 => whole(component::HEADER1),
            PatchTarget::Header2 => whole(component::HEADER2),
        }
    }
}

impl fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for PatchTarget {
    type Err = String;

    /// Accepts the settings key, ignoring case and treating `-` like `_`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|t| t.key() == key)
            .ok_or_else(|| format!("unknown patch target '{}'", s))
    }
}
