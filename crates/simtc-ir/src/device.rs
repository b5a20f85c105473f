//! Device (core) descriptions consumed by the tiling advisor and the backend.

use std::fmt;
use std::str::FromStr;

use crate::error::{CompilationError, Result, Status};

/// Optional hardware features of a core.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CoreFeatureFlags(u32);

impl CoreFeatureFlags {
    pub const EMPTY: Self = Self(0);
    /// Request the large register file (doubles the per-lane register space).
    pub const LARGE_REGISTER_FILE: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CoreFeatureFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Known device presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CorePreset {
    /// Ponte Vecchio class data-center GPU.
    Pvc,
    /// Tiger Lake class integrated GPU.
    Tgl,
    /// Conservative defaults for unknown devices.
    Generic,
}

impl CorePreset {
    pub const ALL: [Self; 3] = [Self::Pvc, Self::Tgl, Self::Generic];

    pub fn name(self) -> &'static str {
        match self {
            Self::Pvc => "pvc",
            Self::Tgl => "tgl",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for CorePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CorePreset {
    type Err = CompilationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name() == s)
            .ok_or_else(|| {
                CompilationError::new(Status::InvalidArguments)
                    .with_extra(format!("unknown core `{s}`"))
            })
    }
}

/// Hardware limits of one compute core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    /// Subgroup sizes offered by the device, ascending.
    pub subgroup_sizes: Vec<u32>,
    /// Register space per subgroup in bytes.
    pub register_space: u32,
    /// Maximum number of work-items per work-group.
    pub max_work_group_size: u32,
    /// Shared local memory per work-group in bytes.
    pub local_memory_size: u32,
    pub features: CoreFeatureFlags,
}

impl CoreConfig {
    pub fn preset(preset: CorePreset) -> Self {
        match preset {
            CorePreset::Pvc => Self {
                subgroup_sizes: vec![16, 32],
                register_space: 8192,
                max_work_group_size: 1024,
                local_memory_size: 128 * 1024,
                features: CoreFeatureFlags::EMPTY,
            },
            CorePreset::Tgl => Self {
                subgroup_sizes: vec![8, 16, 32],
                register_space: 4096,
                max_work_group_size: 512,
                local_memory_size: 64 * 1024,
                features: CoreFeatureFlags::EMPTY,
            },
            CorePreset::Generic => Self {
                subgroup_sizes: vec![16],
                register_space: 4096,
                max_work_group_size: 256,
                local_memory_size: 64 * 1024,
                features: CoreFeatureFlags::EMPTY,
            },
        }
    }

    /// Looks up a preset by name (`pvc`, `tgl`, `generic`).
    pub fn for_target(name: &str) -> Result<Self> {
        name.parse().map(Self::preset)
    }

    pub fn with_features(mut self, features: CoreFeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Register space available to a subgroup, taking feature flags into account.
    pub fn effective_register_space(&self) -> u32 {
        if self.features.contains(CoreFeatureFlags::LARGE_REGISTER_FILE) {
            self.register_space * 2
        } else {
            self.register_space
        }
    }

    pub fn supports_subgroup_size(&self, size: u32) -> bool {
        self.subgroup_sizes.contains(&size)
    }

    /// The same core restricted to subgroup size `size`.
    pub fn subgroup(&self, size: u32) -> Result<Self> {
        if !self.supports_subgroup_size(size) {
            return Err(CompilationError::new(Status::UnsupportedSubgroupSize)
                .with_extra(format!("{size} not in {:?}", self.subgroup_sizes)));
        }
        Ok(Self {
            subgroup_sizes: vec![size],
            ..self.clone()
        })
    }

    /// Checks a user- or advisor-chosen launch configuration.
    pub fn check_launch(&self, subgroup_size: u32, work_group_size: [u32; 2]) -> Result<()> {
        if !self.supports_subgroup_size(subgroup_size) {
            return Err(Status::UnsupportedSubgroupSize.into());
        }
        let [x, y] = work_group_size;
        let total = u64::from(x) * u64::from(y);
        if x == 0 || y == 0 || x % subgroup_size != 0 || total > u64::from(self.max_work_group_size)
        {
            return Err(CompilationError::new(Status::UnsupportedWorkGroupSize)
                .with_extra(format!("[{x}, {y}] with subgroup size {subgroup_size}")));
        }
        Ok(())
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::preset(CorePreset::Generic)
    }
}

impl fmt::Display for CoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: Vec<_> = self.subgroup_sizes.iter().map(u32::to_string).collect();
        writeln!(f, "subgroup sizes:      {}", sizes.join(", "))?;
        writeln!(f, "register space:      {} B", self.effective_register_space())?;
        writeln!(f, "max work-group size: {}", self.max_work_group_size)?;
        write!(f, "local memory:        {} B", self.local_memory_size)
    }
}
