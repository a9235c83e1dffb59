use std::{
    fs::{File, Permissions},
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use anyhow::{Context, Error};

/// Creates a file and all parent directories if they don't exist
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    std::fs::File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates a file and all parent directories if they don't exist, and sets the file mode
pub fn create_file_mode<S>(path: S, mode: u32) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    let file = create_file(path.as_ref())?;
    std::fs::set_permissions(path.as_ref(), Permissions::from_mode(mode)).context(format!(
        "Could not set permissions {:#o} for file {}",
        mode,
        path.as_ref().display()
    ))?;
    Ok(file)
}

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Reads the content of a file and trims it
pub fn read_file_trim<S>(file_path: &S) -> Result<String, Error>
where
    S: AsRef<Path>,
{
    let content = std::fs::read_to_string(file_path.as_ref()).context(format!(
        "Could not read file contents: {:?}",
        file_path.as_ref()
    ))?;
    Ok(content.trim().to_string())
}

/// Writes to a file
pub fn write_file<S>(path: S, mode: u32, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let mut file = create_file_mode(path.as_ref(), mode).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))?;

    file.write_all(contents).context(format!(
        "Could not write to file: {}",
        path.as_ref().display()
    ))?;

    Ok(())
}

/// Writes to a temporary file next to `path` and renames it into place, so
/// readers see either the old or the new contents.
pub fn write_file_atomic<S>(path: S, mode: u32, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    let parent = path
        .parent()
        .context(format!("Path has no parent: {}", path.display()))?;
    create_dirs(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .context(format!("Failed to create temporary file in {}", parent.display()))?;
    tmp.write_all(contents)
        .context(format!("Could not write to temporary file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .context(format!("Could not sync temporary file for {}", path.display()))?;
    std::fs::set_permissions(tmp.path(), Permissions::from_mode(mode)).context(format!(
        "Could not set permissions {:#o} for file {}",
        mode,
        path.display()
    ))?;
    tmp.persist(path)
        .context(format!("Could not move file into place: {}", path.display()))?;

    Ok(())
}

/// Removes a file, succeeding when it is already gone. Returns whether a file
/// was removed.
pub fn remove_file_if_exists<S>(path: S) -> Result<bool, Error>
where
    S: AsRef<Path>,
{
    match std::fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(format!(
            "Could not remove file: {}",
            path.as_ref().display()
        )),
    }
}

/// Copies a file, creating parent directories and setting the mode of the
/// copy.
pub fn copy_file_mode<S, T>(source: S, destination: T, mode: u32) -> Result<(), Error>
where
    S: AsRef<Path>,
    T: AsRef<Path>,
{
    if let Some(parent) = destination.as_ref().parent() {
        create_dirs(parent)?;
    }
    std::fs::copy(source.as_ref(), destination.as_ref()).context(format!(
        "Could not copy {} to {}",
        source.as_ref().display(),
        destination.as_ref().display()
    ))?;
    std::fs::set_permissions(destination.as_ref(), Permissions::from_mode(mode)).context(
        format!(
            "Could not set permissions {:#o} for file {}",
            mode,
            destination.as_ref().display()
        ),
    )
}
