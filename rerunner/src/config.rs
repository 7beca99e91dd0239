use std::path::{Path, PathBuf};

use anyhow::Context;

/// The guest command line recorded next to the function objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserArgs {
    /// Path to the guest executable.
    pub binary: PathBuf,

    /// The arguments passed to the guest, starting with `argv[0]`.
    pub argv: Vec<String>,
}

impl UserArgs {
    pub const FILE_NAME: &'static str = "user_args";

    pub fn read(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(Self::FILE_NAME);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid {}", path.display()))
    }

    /// Parses `argc binary argv[0] ... argv[argc - 1]`. Tokens are separated by whitespace and
    /// anything after the last argument is ignored.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut tokens = content.split_whitespace();

        let argc = tokens.next().context("missing argument count")?;
        let argc: usize = argc.parse().with_context(|| format!("invalid argument count: {argc}"))?;
        let binary = tokens.next().context("missing path to the guest binary")?;

        let argv: Vec<String> = tokens.take(argc).map(String::from).collect();
        anyhow::ensure!(argv.len() == argc, "expected {argc} arguments, found {}", argv.len());

        Ok(Self { binary: binary.into(), argv })
    }
}
