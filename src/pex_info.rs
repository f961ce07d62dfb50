use crate::prelude::*;
use indexmap::IndexMap;

/// How the generated launcher exposes the venv's bin directory on PATH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinPath {
    #[default]
    False,
    Append,
    Prepend,
}

impl Display for BinPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                BinPath::False => "false",
                BinPath::Append => "append",
                BinPath::Prepend => "prepend",
            }
        )
    }
}

fn default_true() -> bool {
    true
}

/// The archive's JSON manifest. Only the fields the bootstrap engine cares
/// about are modeled; everything else passes through untouched because the
/// verbatim bytes are kept for re-emission into the venv.
#[derive(Debug, Clone, Deserialize)]
pub struct PexInfo {
    pub pex_hash: Option<String>,
    #[serde(default)]
    pub distributions: IndexMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub interpreter_constraints: Vec<InterpreterConstraint>,
    #[serde(default)]
    pub venv_system_site_packages: bool,
    #[serde(default = "default_true")]
    pub venv_hermetic_scripts: bool,
    #[serde(default)]
    pub venv_bin_path: BinPath,
    #[serde(default = "default_true")]
    pub strip_pex_env: bool,
    #[serde(default)]
    pub inject_env: IndexMap<String, String>,
    #[serde(default)]
    pub inject_args: Vec<String>,
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(skip)]
    raw: Vec<u8>,
}

impl PexInfo {
    pub const ENTRY_NAME: &'static str = "PEX-INFO";

    pub fn from_bytes(raw: &[u8]) -> Result<PexInfo> {
        context!("decoding {}", PexInfo::ENTRY_NAME);
        let mut info: PexInfo = serde_json::from_slice(raw)?;
        if let Some(hash) = &info.pex_hash {
            // 40 hex chars = 160 bits of SHA-1
            info.pex_hash_bytes()
                .wrap_err_with(|| format!("bad pex_hash {:?}", hash))?;
        }
        info.raw = raw.to_vec();
        Ok(info)
    }

    /// The manifest exactly as it appeared in the archive.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The decoded 20-byte archive identity, if the manifest has one.
    pub fn pex_hash_bytes(&self) -> Result<Option<Vec<u8>>> {
        let hash = match &self.pex_hash {
            Some(hash) => hash,
            None => return Ok(None),
        };
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(hash.as_bytes())
            .map_err(|e| eyre!("pex_hash is not valid hex: {}", e))?;
        if bytes.len() != 20 {
            bail!("pex_hash must be 40 hex chars, got {}", hash.len());
        }
        Ok(Some(bytes))
    }

    pub fn constraints(&self) -> InterpreterConstraints {
        InterpreterConstraints(self.interpreter_constraints.clone())
    }
}

/// Sidecar metadata a wheel directory may carry under `.deps/<wheel>/`.
/// Anything we don't recognize is ignored for forward compatibility.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WheelLayout {
    #[serde(default)]
    pub stash_dir: Option<String>,
}

impl WheelLayout {
    pub const FILE_NAME: &'static str = ".layout.json";

    pub fn from_bytes(raw: &[u8]) -> Result<WheelLayout> {
        Ok(serde_json::from_slice(raw)?)
    }
}
