use crate::interpreter::{Interpreter, PythonVersion};
use crate::prelude::*;
use crate::archive::ArchiveWriter;
use std::path::Path;

/// A descriptor for tests that don't want to spawn a real python. The
/// canonical path usually points at a plain file created by the test.
pub fn fake_interpreter(canonical: &Path, implementation: &str) -> Interpreter {
    Interpreter {
        python: canonical.to_owned(),
        canonical_python: canonical.to_owned(),
        prefix: canonical.parent().unwrap().to_owned(),
        base_prefix: canonical.parent().unwrap().to_owned(),
        version: PythonVersion {
            major: 3,
            minor: 11,
            micro: 4,
            releaselevel: "final".into(),
        },
        markers: MarkerEnvironment {
            os_name: "posix".into(),
            sys_platform: "linux".into(),
            platform_machine: "x86_64".into(),
            platform_python_implementation: implementation.into(),
            platform_system: "Linux".into(),
            python_version: "3.11".into(),
            python_full_version: "3.11.4".into(),
            implementation_name: implementation.to_ascii_lowercase(),
            implementation_version: "3.11.4".into(),
            ..Default::default()
        },
        is_framework: false,
        has_ensurepip: false,
        supported_tags: vec![
            Tag::new("cp311", "cp311", "linux_x86_64"),
            Tag::new("cp311", "abi3", "linux_x86_64"),
            Tag::new("cp311", "none", "linux_x86_64"),
            Tag::new("py3", "none", "linux_x86_64"),
            Tag::new("py3", "none", "any"),
            Tag::new("py2", "none", "any"),
        ],
    }
}

/// A python stand-in the identification machinery can actually spawn: a
/// shell script that emits a canned descriptor and bumps a `.probes` counter
/// file so tests can see how often the probe really ran.
#[cfg(unix)]
pub fn write_probe_shim(
    dir: &Path,
    name: &str,
    version: (u32, u32, u32),
) -> std::path::PathBuf {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let counter = dir.join(format!("{name}.probes"));
    let descriptor = serde_json::json!({
        "python": path.to_str().unwrap(),
        "canonical_python": path.to_str().unwrap(),
        "prefix": "/usr",
        "base_prefix": "/usr",
        "version": {
            "major": version.0,
            "minor": version.1,
            "micro": version.2,
            "releaselevel": "final",
        },
        "markers": {
            "os_name": "posix",
            "sys_platform": "linux",
            "platform_python_implementation": "CPython",
            "python_version": format!("{}.{}", version.0, version.1),
            "python_full_version": format!("{}.{}.{}", version.0, version.1, version.2),
            "implementation_name": "cpython",
            "implementation_version": format!("{}.{}.{}", version.0, version.1, version.2),
        },
        "is_framework": false,
        "has_ensurepip": false,
        "supported_tags": [
            format!("cp{maj}{min}-cp{maj}{min}-linux_x86_64", maj = version.0, min = version.1),
            format!("py{}-none-any", version.0),
        ],
    });
    let script = format!(
        "#!/bin/sh\necho . >> {:?}\ncat > \"$4\" << 'CZEX_EOF'\n{}\nCZEX_EOF\n",
        counter, descriptor
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
pub fn probe_count(dir: &Path, name: &str) -> usize {
    std::fs::read(dir.join(format!("{name}.probes")))
        .map(|data| data.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count())
        .unwrap_or(0)
}

/// Builder for PEX-shaped archives: a PEX-INFO manifest plus wheel trees
/// under `.deps/`.
pub struct TestPex {
    pex_info: serde_json::Value,
    entries: Vec<(String, Vec<u8>)>,
}

impl TestPex {
    pub fn new(pex_info: serde_json::Value) -> TestPex {
        TestPex {
            pex_info,
            entries: vec![],
        }
    }

    pub fn wheel(mut self, filename: &str, files: &[(&str, &str)]) -> TestPex {
        for (path, content) in files {
            self.entries.push((
                format!(".deps/{}/{}", filename, path),
                content.as_bytes().to_vec(),
            ));
        }
        self
    }

    pub fn write(self, path: &Path) {
        let mut writer = ArchiveWriter::create(path, true).unwrap();
        writer
            .add_file(
                crate::pex_info::PexInfo::ENTRY_NAME,
                &serde_json::to_vec(&self.pex_info).unwrap(),
            )
            .unwrap();
        for (name, data) in &self.entries {
            writer.add_file(name, data).unwrap();
        }
        writer.finish().unwrap();
    }
}
