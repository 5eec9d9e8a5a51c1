//! Template cloning for new execution units.
//!
//! A unit named `N` lives on disk as a directory `N.avd/` plus a descriptor
//! `N.ini` under the AVD home. Clones of the template `T` are named
//! `T_Clone<ordinal>`.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ProvisionerConfig;
use crate::error::{FleetError, Result};

/// A `*.avd` directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredUnit {
    pub name: String,
    pub directory: PathBuf,
    pub has_descriptor: bool,
}

/// Creates units by cloning the template.
#[derive(Debug, Clone)]
pub struct Provisioner {
    avd_home: PathBuf,
    template: String,
    clone_pattern: Regex,
}

impl Provisioner {
    pub fn new(config: &ProvisionerConfig) -> std::result::Result<Self, regex::Error> {
        let clone_pattern = Regex::new(&format!(
            r"^{}_Clone(\d+)\.(avd|ini)$",
            regex::escape(&config.template)
        ))?;
        Ok(Self {
            avd_home: config.avd_home.clone(),
            template: config.template.clone(),
            clone_pattern,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn avd_home(&self) -> &Path {
        &self.avd_home
    }

    pub fn unit_directory(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd"))
    }

    pub fn unit_descriptor(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.ini"))
    }

    pub fn clone_name(&self, ordinal: u32) -> String {
        format!("{}_Clone{ordinal}", self.template)
    }

    /// Fails with `TemplateMissing` unless both template artifacts exist.
    pub fn verify_template(&self) -> Result<()> {
        let directory = self.unit_directory(&self.template);
        if !directory.is_dir() {
            return Err(FleetError::TemplateMissing(format!(
                "directory {} does not exist",
                directory.display()
            )));
        }
        let descriptor = self.unit_descriptor(&self.template);
        if !descriptor.is_file() {
            return Err(FleetError::TemplateMissing(format!(
                "descriptor {} does not exist",
                descriptor.display()
            )));
        }
        Ok(())
    }

    /// Top-level entries of the AVD home. Empty when it does not exist yet.
    fn entries(&self) -> Result<Vec<walkdir::DirEntry>> {
        if !self.avd_home.exists() {
            return Ok(Vec::new());
        }
        WalkDir::new(&self.avd_home)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| entry.map_err(|e| FleetError::Io(io::Error::from(e))))
            .collect()
    }

    fn clone_ordinal(&self, file_name: &str) -> Option<(u32, bool)> {
        let captures = self.clone_pattern.captures(file_name)?;
        let ordinal = captures.get(1)?.as_str().parse().ok()?;
        let is_directory = captures.get(2)?.as_str() == "avd";
        Some((ordinal, is_directory))
    }

    /// Sorted ordinals of clones that have both a directory and a descriptor.
    pub fn list_existing_clones(&self) -> Result<Vec<u32>> {
        let ordinals: BTreeSet<u32> = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| self.clone_ordinal(&entry.file_name().to_string_lossy()))
            .filter(|(_, is_directory)| *is_directory)
            .map(|(ordinal, _)| ordinal)
            .filter(|ordinal| self.unit_descriptor(&self.clone_name(*ordinal)).is_file())
            .collect();
        Ok(ordinals.into_iter().collect())
    }

    /// Clone ordinals whose directory exists but whose descriptor does not.
    pub fn list_incomplete_clones(&self) -> Result<Vec<u32>> {
        let ordinals: BTreeSet<u32> = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| self.clone_ordinal(&entry.file_name().to_string_lossy()))
            .map(|(ordinal, _)| ordinal)
            .filter(|ordinal| !self.unit_descriptor(&self.clone_name(*ordinal)).is_file())
            .collect();
        Ok(ordinals.into_iter().collect())
    }

    /// One past the highest ordinal of any clone artifact on disk, or 1.
    ///
    /// Partial clones count too, so a retried clone never lands on top of
    /// leftovers from a failed one. Fails with `CloneIo` once the highest
    /// ordinal is `u32::MAX`.
    pub fn next_clone_ordinal(&self) -> Result<u32> {
        let highest = self
            .entries()?
            .into_iter()
            .filter_map(|entry| self.clone_ordinal(&entry.file_name().to_string_lossy()))
            .map(|(ordinal, _)| ordinal)
            .max();
        match highest {
            None => Ok(1),
            Some(max) => max.checked_add(1).ok_or_else(|| FleetError::CloneIo {
                unit: self.clone_name(max),
                source: io::Error::other("no clone ordinal left after this one"),
            }),
        }
    }

    /// Copy the template to the next ordinal and return the new unit name.
    ///
    /// Partial state is left in place on failure.
    pub fn clone_template(&self) -> Result<String> {
        self.verify_template()?;

        let name = self.clone_name(self.next_clone_ordinal()?);
        let directory = self.unit_directory(&name);
        let descriptor = self.unit_descriptor(&name);
        let clone_io = |source: io::Error| FleetError::CloneIo {
            unit: name.clone(),
            source,
        };

        info!(unit = %name, template = %self.template, "Cloning template");

        copy_dir(&self.unit_directory(&self.template), &directory).map_err(clone_io)?;

        let template_descriptor =
            fs::read_to_string(self.unit_descriptor(&self.template)).map_err(clone_io)?;
        let absolute = std::path::absolute(&directory).map_err(clone_io)?;
        let rewritten = rewrite_descriptor(&template_descriptor, &absolute, &name);
        fs::write(&descriptor, rewritten).map_err(clone_io)?;

        debug!(unit = %name, directory = %directory.display(), "Clone written");
        Ok(name)
    }

    /// Every `*.avd` directory under the AVD home.
    pub fn discover_all(&self) -> Result<Vec<DiscoveredUnit>> {
        let units = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.file_type().is_dir())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let name = file_name.strip_suffix(".avd")?.to_string();
                let has_descriptor = self.unit_descriptor(&name).is_file();
                Some(DiscoveredUnit {
                    name,
                    directory: entry.into_path(),
                    has_descriptor,
                })
            })
            .collect();
        Ok(units)
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Point `path=` and `path.rel=` at the clone; keep every other line.
fn rewrite_descriptor(contents: &str, directory: &Path, name: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    for line in contents.lines() {
        if line.starts_with("path=") {
            out.push_str(&format!("path={}", directory.display()));
        } else if line.starts_with("path.rel=") {
            out.push_str(&format!("path.rel=avd/{name}.avd"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const TEMPLATE: &str = "Nexus_5_API_31";

    /// Lay out a template `.avd` directory and `.ini` descriptor.
    pub(crate) fn seed_template(home: &Path) {
        let dir = home.join(format!("{TEMPLATE}.avd"));
        fs::create_dir_all(dir.join("snapshots")).unwrap();
        fs::write(dir.join("config.ini"), "hw.lcd.density=480\n").unwrap();
        fs::write(dir.join("snapshots").join("default.bin"), b"snap").unwrap();
        fs::write(
            home.join(format!("{TEMPLATE}.ini")),
            format!(
                "avd.ini.encoding=UTF-8\npath={}\npath.rel=avd/{TEMPLATE}.avd\ntarget=android-31\n",
                dir.display()
            ),
        )
        .unwrap();
    }

    pub(crate) fn provisioner(home: &Path) -> Provisioner {
        Provisioner::new(&ProvisionerConfig {
            avd_home: home.to_path_buf(),
            template: TEMPLATE.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_verify_template_missing() {
        let home = TempDir::new().unwrap();
        let err = provisioner(home.path()).verify_template().unwrap_err();
        assert_eq!(err.reason_code(), "template_missing");

        // Directory without descriptor is still missing.
        fs::create_dir_all(home.path().join(format!("{TEMPLATE}.avd"))).unwrap();
        let err = provisioner(home.path()).verify_template().unwrap_err();
        assert!(err.to_string().contains(".ini"));
    }

    #[test]
    fn test_missing_home_has_no_clones() {
        let home = TempDir::new().unwrap();
        let p = provisioner(&home.path().join("nope"));
        assert!(p.list_existing_clones().unwrap().is_empty());
        assert_eq!(p.next_clone_ordinal().unwrap(), 1);
    }

    #[test]
    fn test_clone_rewrites_descriptor_paths() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        let p = provisioner(home.path());

        let name = p.clone_template().unwrap();
        assert_eq!(name, "Nexus_5_API_31_Clone1");

        let dir = p.unit_directory(&name);
        assert!(dir.join("config.ini").is_file());
        assert!(dir.join("snapshots").join("default.bin").is_file());

        let ini = fs::read_to_string(p.unit_descriptor(&name)).unwrap();
        let absolute = std::path::absolute(&dir).unwrap();
        assert!(ini.contains(&format!("path={}\n", absolute.display())));
        assert!(ini.contains("path.rel=avd/Nexus_5_API_31_Clone1.avd\n"));
        assert!(ini.contains("target=android-31\n"));
        assert!(!ini.contains(&format!("path.rel=avd/{TEMPLATE}.avd")));
    }

    #[test]
    fn test_ordinals_only_grow() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        let p = provisioner(home.path());

        assert_eq!(p.clone_template().unwrap(), "Nexus_5_API_31_Clone1");
        assert_eq!(p.clone_template().unwrap(), "Nexus_5_API_31_Clone2");

        // Retire clone 1; the next ordinal still follows the maximum.
        fs::remove_dir_all(p.unit_directory("Nexus_5_API_31_Clone1")).unwrap();
        fs::remove_file(p.unit_descriptor("Nexus_5_API_31_Clone1")).unwrap();
        assert_eq!(p.list_existing_clones().unwrap(), vec![2]);
        assert_eq!(p.next_clone_ordinal().unwrap(), 3);
    }

    #[test]
    fn test_list_skips_clones_without_descriptor() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        let p = provisioner(home.path());
        p.clone_template().unwrap();
        fs::create_dir_all(home.path().join("Nexus_5_API_31_Clone7.avd")).unwrap();
        fs::create_dir_all(home.path().join("Other_Clone3.avd")).unwrap();

        assert_eq!(p.list_existing_clones().unwrap(), vec![1]);
        assert_eq!(p.list_incomplete_clones().unwrap(), vec![7]);
        // The partial clone still reserves its ordinal.
        assert_eq!(p.next_clone_ordinal().unwrap(), 8);
    }

    #[test]
    fn test_exhausted_ordinals_fail_to_clone() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        fs::create_dir_all(home.path().join(format!("{TEMPLATE}_Clone{}.avd", u32::MAX))).unwrap();
        let p = provisioner(home.path());

        let err = p.next_clone_ordinal().unwrap_err();
        assert_eq!(err.reason_code(), "clone_io_error");
        let err = p.clone_template().unwrap_err();
        assert_eq!(err.reason_code(), "clone_io_error");
        assert!(!home.path().join(format!("{TEMPLATE}_Clone0.avd")).exists());
    }

    #[test]
    fn test_orphan_descriptor_reserves_ordinal() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        fs::write(home.path().join("Nexus_5_API_31_Clone4.ini"), "path=x\n").unwrap();
        let p = provisioner(home.path());

        assert!(p.list_existing_clones().unwrap().is_empty());
        assert_eq!(p.clone_template().unwrap(), "Nexus_5_API_31_Clone5");
    }

    #[test]
    fn test_clone_ordinals_sort_numerically() {
        let home = TempDir::new().unwrap();
        for n in [10, 2, 1] {
            let name = format!("{TEMPLATE}_Clone{n}");
            fs::create_dir_all(home.path().join(format!("{name}.avd"))).unwrap();
            fs::write(home.path().join(format!("{name}.ini")), "").unwrap();
        }
        assert_eq!(
            provisioner(home.path()).list_existing_clones().unwrap(),
            vec![1, 2, 10]
        );
    }

    #[test]
    fn test_discover_all() {
        let home = TempDir::new().unwrap();
        seed_template(home.path());
        fs::create_dir_all(home.path().join("Pixel_7.avd")).unwrap();

        let found = provisioner(home.path()).discover_all().unwrap();
        let names: Vec<_> = found.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec![TEMPLATE, "Pixel_7"]);
        assert!(found[0].has_descriptor);
        assert!(!found[1].has_descriptor);
    }

    #[test]
    fn test_rewrite_descriptor_keeps_other_lines() {
        let out = rewrite_descriptor(
            "a=1\npath=/old\npath.rel=avd/old.avd\n",
            Path::new("/new/X.avd"),
            "X",
        );
        assert_eq!(out, "a=1\npath=/new/X.avd\npath.rel=avd/X.avd\n");
    }
}
