use anyhow::Context;

/// The calling convention used to transfer control between translated functions.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DispatchKind {
    /// Guest registers are kept in the register file across calls.
    #[default]
    Generic,

    /// Guest registers are pinned to host registers across calls.
    Pinned,
}

impl std::str::FromStr for DispatchKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generic" | "cdecl" => Ok(Self::Generic),
            "pinned" | "fast" => Ok(Self::Pinned),
            _ => anyhow::bail!("unknown dispatch kind: {s} (expected `generic` or `pinned`)"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub dispatch: DispatchKind,

    /// Address to reserve the data arena at. The code arena is placed directly after it. If
    /// `None` the kernel picks the location of both arenas.
    pub mem_base: Option<usize>,

    pub data_size: usize,
    pub code_size: usize,
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchKind::Generic,
            mem_base: Some(rerun_mem::DEFAULT_BASE),
            data_size: rerun_mem::DEFAULT_DATA_SIZE,
            code_size: rerun_mem::DEFAULT_CODE_SIZE,
            stack_size: 0x0100_0000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a configuration from variables returned by `get`, using defaults for anything that is
    /// not set.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(kind) = get("RERUN_DISPATCH") {
            config.dispatch = kind.parse().context("error parsing `RERUN_DISPATCH`")?;
        }

        let size = |name: &str, default: usize| -> anyhow::Result<usize> {
            let Some(value) = get(name) else {
                return Ok(default);
            };
            let size = parse_u64_with_prefix(&value)
                .with_context(|| format!("error parsing `{name}`: {value}"))?;
            anyhow::ensure!(size != 0, "`{name}` must be non-zero");
            Ok(size as usize)
        };
        config.data_size = size("RERUN_DATA_SIZE", config.data_size)?;
        config.code_size = size("RERUN_CODE_SIZE", config.code_size)?;
        config.stack_size = size("RERUN_STACK_SIZE", config.stack_size)?;

        if let Some(value) = get("RERUN_MEM_BASE") {
            let base = parse_u64_with_prefix(&value)
                .with_context(|| format!("error parsing `RERUN_MEM_BASE`: {value}"))?;
            config.mem_base = (base != 0).then_some(base as usize);
        }

        Ok(config)
    }
}

pub fn parse_u64_with_prefix(value: &str) -> Option<u64> {
    let value = value.trim().replace('_', "");
    let (value, radix) = match value.get(0..2) {
        Some("0x") => (&value[2..], 16),
        Some("0o") => (&value[2..], 8),
        Some("0b") => (&value[2..], 2),
        _ => (&value[..], 10),
    };

    u64::from_str_radix(value, radix).ok()
}
