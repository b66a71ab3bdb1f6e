//! Common test utilities for Genesis binary tests
#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

/// Isolated home directory; every command runs with `HOME` pointed at it
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            temp_dir: tempdir()?,
        })
    }

    /// `~/.genesis` inside the test home
    pub fn data_dir(&self) -> PathBuf {
        self.temp_dir.path().join(".genesis")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir().join("config.json")
    }

    pub fn system_plugins_dir(&self) -> PathBuf {
        self.data_dir().join("plugins")
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_genesis"));
        cmd.env("HOME", self.temp_dir.path());
        cmd.env_remove("RUST_LOG");
        cmd
    }

    /// Run `genesis init` and panic if it fails
    pub fn init(&self) {
        self.command().arg("init").assert().success();
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
