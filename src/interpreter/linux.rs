use crate::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;

/// What the dynamic loader of the target python told us about its libc.
/// Serialized and handed to the probe script via `--linux-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxInfo {
    pub libc: String,
    pub version: String,
}

/// Find the python binary's ELF interpreter (`PT_INTERP`) and ask it which
/// libc version it is. A python with no PT_INTERP (static binary, or a script
/// wrapper that slipped through) yields None and the probe goes without.
pub fn detect(python: &Path) -> Result<Option<LinuxInfo>> {
    context!("detecting libc for {}", python.display());
    let loader = match elf_interp(&fs::read(python)?)? {
        Some(loader) => loader,
        None => return Ok(None),
    };
    if loader.contains("musl") {
        Ok(Some(musl_version(&loader)?))
    } else {
        Ok(Some(glibc_version(&loader)?))
    }
}

const PT_INTERP: u32 = 3;

struct ElfReader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> ElfReader<'a> {
    fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| eyre!("truncated ELF (wanted {} bytes at {})", len, offset))
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let raw: [u8; 2] = self.bytes(offset, 2)?.try_into().unwrap();
        Ok(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let raw: [u8; 4] = self.bytes(offset, 4)?.try_into().unwrap();
        Ok(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn u64(&self, offset: usize) -> Result<u64> {
        let raw: [u8; 8] = self.bytes(offset, 8)?.try_into().unwrap();
        Ok(if self.big_endian {
            u64::from_be_bytes(raw)
        } else {
            u64::from_le_bytes(raw)
        })
    }
}

/// Pull the PT_INTERP path out of an ELF image, handling both widths and both
/// endiannesses.
fn elf_interp(data: &[u8]) -> Result<Option<String>> {
    if data.len() < 0x40 || &data[..4] != b"\x7fELF" {
        bail!("not an ELF file");
    }
    let is_64 = match data[4] {
        1 => false,
        2 => true,
        class => bail!("unsupported ELF class {}", class),
    };
    let big_endian = match data[5] {
        1 => false,
        2 => true,
        encoding => bail!("unsupported ELF data encoding {}", encoding),
    };
    let elf = ElfReader { data, big_endian };

    let (phoff, phentsize, phnum) = if is_64 {
        (elf.u64(0x20)? as usize, elf.u16(0x36)? as usize, elf.u16(0x38)? as usize)
    } else {
        (elf.u32(0x1c)? as usize, elf.u16(0x2a)? as usize, elf.u16(0x2c)? as usize)
    };
    if phoff > data.len() {
        bail!("program header table out of range");
    }

    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if elf.u32(ph)? != PT_INTERP {
            continue;
        }
        let (offset, filesz) = if is_64 {
            (elf.u64(ph + 0x08)? as usize, elf.u64(ph + 0x20)? as usize)
        } else {
            (elf.u32(ph + 0x04)? as usize, elf.u32(ph + 0x10)? as usize)
        };
        let raw = elf.bytes(offset, filesz)?;
        // NUL-terminated
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        return Ok(Some(String::from_utf8(raw[..end].to_vec())?));
    }
    Ok(None)
}

/// The musl loader run with no arguments prints a usage message to stderr
/// whose second line is "Version X.Y.Z".
fn musl_version(loader: &str) -> Result<LinuxInfo> {
    let output = Command::new(loader)
        .output()
        .wrap_err_with(|| format!("failed to run {}", loader))?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    let version_line = stderr
        .lines()
        .nth(1)
        .ok_or_else(|| eyre!("unexpected musl loader output: {:?}", stderr))?;
    let version = version_line
        .strip_prefix("Version ")
        .ok_or_else(|| eyre!("unexpected musl version line: {:?}", version_line))?;
    Ok(LinuxInfo {
        libc: "musl".into(),
        version: major_minor(version),
    })
}

/// The glibc loader announces itself on stdout with a line ending in
/// "... release version X.Y."
fn glibc_version(loader: &str) -> Result<LinuxInfo> {
    let output = Command::new(loader)
        .arg("--version")
        .output()
        .wrap_err_with(|| format!("failed to run {}", loader))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or("");
    let version = first
        .split("release version ")
        .nth(1)
        .ok_or_else(|| eyre!("unexpected glibc loader output: {:?}", first))?;
    Ok(LinuxInfo {
        libc: "glibc".into(),
        version: major_minor(version),
    })
}

fn major_minor(version: &str) -> String {
    version
        .trim()
        .trim_end_matches('.')
        .split('.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod test {
    use super::*;

    // Build a minimal ELF64 image with one program header.
    fn fake_elf64(interp: Option<&[u8]>) -> Vec<u8> {
        let mut data = vec![0u8; 0x40];
        data[..4].copy_from_slice(b"\x7fELF");
        data[4] = 2; // 64-bit
        data[5] = 1; // little-endian
        let phoff = 0x40u64;
        let phentsize = 0x38u16;
        let phnum = 1u16;
        data[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        data[0x36..0x38].copy_from_slice(&phentsize.to_le_bytes());
        data[0x38..0x3a].copy_from_slice(&phnum.to_le_bytes());

        let mut phdr = vec![0u8; 0x38];
        match interp {
            Some(interp) => {
                let offset = (0x40 + 0x38) as u64;
                phdr[0..4].copy_from_slice(&PT_INTERP.to_le_bytes());
                phdr[0x08..0x10].copy_from_slice(&offset.to_le_bytes());
                phdr[0x20..0x28]
                    .copy_from_slice(&((interp.len() + 1) as u64).to_le_bytes());
            }
            None => {
                // PT_LOAD
                phdr[0..4].copy_from_slice(&1u32.to_le_bytes());
            }
        }
        data.extend_from_slice(&phdr);
        if let Some(interp) = interp {
            data.extend_from_slice(interp);
            data.push(0);
        }
        data
    }

    #[test]
    fn test_elf_interp_found() {
        let image = fake_elf64(Some(b"/lib64/ld-linux-x86-64.so.2"));
        assert_eq!(
            elf_interp(&image).unwrap().as_deref(),
            Some("/lib64/ld-linux-x86-64.so.2")
        );
    }

    #[test]
    fn test_elf_interp_absent() {
        let image = fake_elf64(None);
        assert_eq!(elf_interp(&image).unwrap(), None);
    }

    #[test]
    fn test_elf_rejects_non_elf() {
        assert!(elf_interp(b"#!/bin/sh\n").is_err());
        assert!(elf_interp(b"\x7fELF").is_err());
    }

    #[test]
    fn test_major_minor() {
        assert_eq!(major_minor("2.35."), "2.35");
        assert_eq!(major_minor("1.2.4"), "1.2");
        assert_eq!(major_minor("2.17"), "2.17");
    }
}
