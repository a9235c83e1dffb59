use std::sync::OnceLock;

use anyhow::{bail, Context, Error};
use log::info;
use regex::Regex;

use crate::dependencies::Dependency;

/// One `BootXXXX` variable.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EfiBootEntry {
    /// Hexadecimal entry number, e.g. `0003`.
    pub id: String,

    /// Firmware menu label.
    pub label: String,

    /// Whether the entry is active.
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EfiBootManagerOutput {
    pub boot_current: Option<String>,
    pub boot_order: Vec<String>,
    pub boot_entries: Vec<EfiBootEntry>,
}

impl EfiBootManagerOutput {
    pub fn parse_efibootmgr_output(output: &str) -> Result<Self, Error> {
        static ENTRY: OnceLock<Regex> = OnceLock::new();
        let entry_re = ENTRY.get_or_init(|| {
            Regex::new(r"^Boot([0-9a-fA-F]{4})(\*?) ([^\t]+)").expect("valid regex")
        });

        let mut parsed = EfiBootManagerOutput::default();
        for line in output.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("BootCurrent:") {
                parsed.boot_current = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("BootOrder:") {
                parsed.boot_order = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            } else if let Some(captures) = entry_re.captures(line) {
                parsed.boot_entries.push(EfiBootEntry {
                    id: captures[1].to_string(),
                    active: !captures[2].is_empty(),
                    label: captures[3].trim().to_string(),
                });
            } else if line.starts_with("Boot") && !line.contains(':') {
                bail!("Error splitting efibootmgr output line '{line}'");
            }
        }
        Ok(parsed)
    }

    pub fn entries_with_label(&self, label: &str) -> Vec<&EfiBootEntry> {
        self.boot_entries
            .iter()
            .filter(|entry| entry.label == label)
            .collect()
    }

    /// Deletes every entry carrying `label`. Returns how many were removed.
    pub fn delete_entries_with_label(&self, label: &str) -> Result<usize, Error> {
        let entries = self.entries_with_label(label);
        for entry in &entries {
            delete_boot_entry(&entry.id).context(format!(
                "Failed to delete boot entry {} through efibootmgr",
                entry.id
            ))?;
            info!("Deleted EFI boot entry Boot{} '{label}'", entry.id);
        }
        Ok(entries.len())
    }
}

pub fn list_and_parse_bootmgr_entries() -> Result<EfiBootManagerOutput, Error> {
    let output = Dependency::Efibootmgr
        .cmd()
        .output_and_check()
        .context("Efibootmgr exited with an error")?;
    EfiBootManagerOutput::parse_efibootmgr_output(&output)
        .context("Failed to parse efibootmgr output")
}

pub fn delete_boot_entry(entry_number: &str) -> Result<(), Error> {
    Dependency::Efibootmgr
        .cmd()
        .arg("--quiet")
        .arg("--delete-bootnum")
        .arg("--bootnum")
        .arg(entry_number)
        .run_and_check()
        .context(format!("Failed to delete boot entry '{entry_number}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    #[test]
    fn test_parse_efibootmgr_output() {
        let output = indoc! {"
            BootCurrent: 0001
            Timeout: 1 seconds
            BootOrder: 0001,0002,0000
            Boot0000* UiApp\tFvVol(7cb8bdc9-f8eb-4f34-aaea-3ee4af6516a1)/FvFile(462caa21-7614-4503-836e-8ab6f4662331)
            Boot0001* Samsung-SSD-9-ABCD\tHD(1,GPT,b46b76eb-b2f9-441a-9686-8b24fa2b2161,0x800,0x200000)/File(\\EFI\\Samsung-SSD-9-ABCD\\shimx64.efi)
            Boot0002* Samsung-SSD-9-WXYZ\tHD(1,GPT,c46b76eb-b2f9-441a-9686-8b24fa2b2161,0x800,0x200000)/File(\\EFI\\Samsung-SSD-9-WXYZ\\shimx64.efi)
            Boot0003  Samsung-SSD-9-WXYZ\tHD(1,GPT,d46b76eb-b2f9-441a-9686-8b24fa2b2161,0x800,0x200000)/File(\\EFI\\Samsung-SSD-9-WXYZ\\shimx64.efi)
        "};

        let parsed = EfiBootManagerOutput::parse_efibootmgr_output(output).unwrap();
        assert_eq!(parsed.boot_current.as_deref(), Some("0001"));
        assert_eq!(parsed.boot_order, vec!["0001", "0002", "0000"]);
        assert_eq!(parsed.boot_entries.len(), 4);
        assert_eq!(
            parsed.boot_entries[1],
            EfiBootEntry {
                id: "0001".into(),
                label: "Samsung-SSD-9-ABCD".into(),
                active: true,
            }
        );
        let duplicates = parsed.entries_with_label("Samsung-SSD-9-WXYZ");
        assert_eq!(duplicates.len(), 2);
        assert!(!duplicates[1].active);
        assert!(parsed.entries_with_label("missing").is_empty());
    }
}
