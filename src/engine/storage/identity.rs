//! Short, human-distinguishing labels for physical drives.
//!
//! Labels double as bootloader folder names on the ESPs and as firmware boot
//! menu titles, so they are limited to `MAX_DRIVE_LABEL_LEN` characters made
//! of ASCII alphanumerics and single hyphens.

use std::path::Path;

use mirroot_api::{
    constants::MAX_DRIVE_LABEL_LEN,
    error::{InternalError, MirrootError},
};

const MODEL_LEN: usize = 15;
const SUFFIX_LEN: usize = 4;

/// Bus prefixes of `/dev/disk/by-id` names, with the generic label used when
/// the name carries no model.
const BUS_PREFIXES: &[(&str, &str)] = &[
    ("nvme-", "NVMe"),
    ("ata-", "Disk"),
    ("scsi-", "Disk"),
    ("usb-", "USB"),
    ("virtio-", "Virtio"),
    ("mmc-", "MMC"),
];

/// Interface markers some controllers repeat at the start of the model.
const REDUNDANT_MODEL_PREFIXES: &[&str] = &["ATA_", "SATA_", "NVMe_", "NVME_", "SCSI_"];

/// Derives the label of the drive at `path`, which should be a stable
/// `/dev/disk/by-id` link. Kernel names such as `/dev/sda` fall back to a
/// generic label built from the node name.
pub fn drive_label(path: impl AsRef<Path>) -> Result<String, MirrootError> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if path.as_os_str().is_empty() || name.is_empty() {
        return Err(MirrootError::new(InternalError::EmptyDevicePath));
    }

    let label = match structured_identity(&name) {
        Some((bus, model, serial)) => join(&normalize_model(bus, model), serial),
        None => generic_label(&name),
    };

    Ok(label.unwrap_or_else(|| format!("Unknown-{}", suffix(&name))))
}

/// Splits `<bus>-<model>_<serial>` into bus prefix, model and serial.
fn structured_identity(name: &str) -> Option<(&'static str, &str, &str)> {
    let (bus, rest) = BUS_PREFIXES
        .iter()
        .find_map(|(prefix, _)| name.strip_prefix(prefix).map(|rest| (*prefix, rest)))?;
    let (model, serial) = rest.trim_end_matches('_').rsplit_once('_')?;
    if model.is_empty() || !serial.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((bus, model, serial))
}

fn normalize_model(bus: &str, model: &str) -> String {
    let mut model = model;
    // scsi-0QEMU_..., scsi-1ATA_...: the leading digit is the SCSI id type.
    if bus == "scsi-" && model.len() > 1 && model.starts_with(|c: char| c.is_ascii_digit()) {
        model = &model[1..];
    }
    while let Some(stripped) = strip_any(model, REDUNDANT_MODEL_PREFIXES) {
        model = stripped;
    }
    sanitize(model)
}

fn strip_any<'a>(text: &'a str, prefixes: &[&str]) -> Option<&'a str> {
    prefixes.iter().find_map(|prefix| text.strip_prefix(prefix))
}

/// Maps every run of characters outside `[A-Za-z0-9]` to one hyphen and trims
/// hyphens at both ends.
fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

fn truncate(text: &str, len: usize) -> String {
    text.chars()
        .take(len)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Last `SUFFIX_LEN` alphanumerics of `raw`, left-padded with zeros.
fn suffix(raw: &str) -> String {
    let alnum: Vec<char> = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    let tail: String = alnum[alnum.len().saturating_sub(SUFFIX_LEN)..]
        .iter()
        .collect();
    format!("{tail:0>SUFFIX_LEN$}")
}

fn join(model: &str, serial: &str) -> Option<String> {
    let model = truncate(model, MODEL_LEN);
    if model.is_empty() {
        return None;
    }
    let label = format!("{model}-{}", suffix(serial));
    debug_assert!(label.len() <= MAX_DRIVE_LABEL_LEN);
    Some(label)
}

/// `NVMe-nvme0n1`, `Disk-sda`, ... for drives without a by-id identity.
fn generic_label(name: &str) -> Option<String> {
    let kind = if name.starts_with("nvme") {
        "NVMe"
    } else if name.starts_with("vd") {
        "Virtio"
    } else if name.starts_with("mmcblk") {
        "MMC"
    } else {
        BUS_PREFIXES
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix))
            .map(|(_, kind)| *kind)
            .unwrap_or("Disk")
    };
    let node = truncate(&sanitize(name), MAX_DRIVE_LABEL_LEN - kind.len() - 1);
    (!node.is_empty()).then(|| format!("{kind}-{node}"))
}
