//! Startup configuration.
//!
//! The configuration is read once, validated, and then handed to [`crate::Mmu::new`].
//! Nothing re-reads it at runtime.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{address::AddressLayout, error::ConfigError};

/// TLB replacement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlbPolicy {
    /// Evict the entry that was loaded first.
    #[default]
    #[serde(rename = "FIFO", alias = "fifo")]
    Fifo,
    /// Evict the entry that was used least recently.
    #[serde(rename = "LRU", alias = "lru")]
    Lru,
}

/// Page content cache replacement policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Second-chance clock over the use bit.
    #[default]
    #[serde(rename = "CLOCK", alias = "clock")]
    Clock,
    /// Clock that prefers clean victims over dirty ones.
    #[serde(rename = "CLOCK-M", alias = "clock-m")]
    ClockM,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlbConfig {
    /// Number of entries. Zero disables the TLB.
    pub entries: usize,
    pub policy: TlbPolicy,
}

impl Default for TlbConfig {
    fn default() -> Self {
        Self {
            entries: 4,
            policy: TlbPolicy::Fifo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of cached pages. Zero bypasses the cache.
    pub entries: usize,
    pub policy: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entries: 4,
            policy: CachePolicy::Clock,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Page and frame size in bytes.
    pub page_size: usize,
    /// Fan-out of every page table node.
    pub entries_per_table: usize,
    /// Depth of the page table tree.
    pub levels: usize,
    /// Size of physical memory in bytes.
    pub memory_size: usize,
    /// Size of the swap store in bytes.
    pub swap_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: 32,
            entries_per_table: 4,
            levels: 2,
            memory_size: 1024,
            swap_size: 4096,
        }
    }
}

/// Complete memory manager configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmuConfig {
    pub tlb: TlbConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
}

impl MmuConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: MmuConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Checks that the values describe a usable machine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let memory = &self.memory;
        if memory.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be non-zero".into()));
        }
        if memory.entries_per_table < 2 {
            return Err(ConfigError::Invalid(
                "entries_per_table must be at least 2".into(),
            ));
        }
        if memory.levels == 0 {
            return Err(ConfigError::Invalid("levels must be at least 1".into()));
        }
        if memory.memory_size < memory.page_size {
            return Err(ConfigError::Invalid(
                "memory_size must hold at least one frame".into(),
            ));
        }
        if memory.memory_size % memory.page_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "memory_size {} is not a multiple of page_size {}",
                memory.memory_size, memory.page_size
            )));
        }
        let max_pages = self.layout().max_pages().ok_or_else(|| {
            ConfigError::Invalid("address space overflows with this table geometry".into())
        })?;
        if max_pages.checked_mul(memory.page_size).is_none() {
            return Err(ConfigError::Invalid(
                "address space overflows with this page size".into(),
            ));
        }
        Ok(())
    }

    /// Number of physical frames.
    pub fn frame_count(&self) -> usize {
        self.memory.memory_size / self.memory.page_size
    }

    pub fn layout(&self) -> AddressLayout {
        AddressLayout::new(
            self.memory.page_size,
            self.memory.entries_per_table,
            self.memory.levels,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = MmuConfig::from_toml_str(
            r#"
            [tlb]
            entries = 8
            policy = "LRU"

            [cache]
            entries = 2
            policy = "CLOCK-M"

            [memory]
            page_size = 64
            entries_per_table = 8
            levels = 3
            memory_size = 4096
            swap_size = 8192
            "#,
        )
        .unwrap();

        assert_eq!(config.tlb.entries, 8);
        assert_eq!(config.tlb.policy, TlbPolicy::Lru);
        assert_eq!(config.cache.policy, CachePolicy::ClockM);
        assert_eq!(config.frame_count(), 64);
        assert_eq!(config.layout().levels(), 3);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config = MmuConfig::from_toml_str("[tlb]\nentries = 0\n").unwrap();
        assert_eq!(config.tlb.entries, 0);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.memory, MemoryConfig::default());
    }

    #[test]
    fn accepts_lowercase_policies() {
        let config =
            MmuConfig::from_toml_str("[tlb]\npolicy = \"lru\"\n[cache]\npolicy = \"clock-m\"\n")
                .unwrap();
        assert_eq!(config.tlb.policy, TlbPolicy::Lru);
        assert_eq!(config.cache.policy, CachePolicy::ClockM);
    }

    #[test]
    fn rejects_unknown_policy() {
        let result = MmuConfig::from_toml_str("[tlb]\npolicy = \"RANDOM\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut config = MmuConfig::default();
        config.memory.memory_size = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MmuConfig::default();
        config.memory.levels = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MmuConfig::default();
        config.memory.entries_per_table = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = MmuConfig::default();
        config.memory.entries_per_table = 1 << 20;
        config.memory.levels = 8;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
