#[cfg(not(windows))]
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};

use std::{
    ffi::{OsStr, OsString},
    fs::{read_link, File, Metadata, OpenOptions},
    io::Read,
    path::{Path, PathBuf},
};

#[cfg(not(windows))]
use cached::proc_macro::cached;
#[cfg(not(windows))]
use chrono::TimeZone;
use chrono::{DateTime, Local, Utc};
use derive_setters::Setters;
use log::warn;
#[cfg(not(windows))]
use nix::fcntl::OFlag;
#[cfg(not(windows))]
use nix::unistd::{Gid, Group, Uid, User};
use path_dedot::ParseDot;
use serde_derive::{Deserialize, Serialize};

#[cfg(not(any(windows, target_os = "openbsd")))]
use crate::backend::node::ExtendedAttribute;
use crate::{
    backend::{
        node::{Metadata as NodeMetadata, Node, NodeType},
        SourceFile, SourceFs,
    },
    error::LocalFsErrorKind,
    PackratResult,
};

#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into)]
/// [`LocalSourceSaveOptions`] describes how entries from the local filesystem will be saved in the repository.
pub struct LocalSourceSaveOptions {
    /// Save access time for files and directories
    #[cfg_attr(feature = "clap", clap(long))]
    pub with_atime: bool,

    /// Don't save device ID for files and directories
    #[cfg_attr(feature = "clap", clap(long))]
    pub ignore_devid: bool,
}

#[derive(Clone, Copy, Debug, Default)]
/// A [`LocalFs`] accesses the local filesystem to be read for a backup.
pub struct LocalFs {
    /// The save options to use.
    save_opts: LocalSourceSaveOptions,
}

impl LocalFs {
    /// Create a local filesystem source using the given [`LocalSourceSaveOptions`].
    #[must_use]
    pub const fn new(save_opts: LocalSourceSaveOptions) -> Self {
        Self { save_opts }
    }
}

/// An open entry of the local filesystem.
///
/// Regular files and directories are backed by an open file descriptor;
/// symlinks and special files are metadata-only, as they cannot be opened
/// with no-follow semantics.
#[derive(Debug)]
pub struct LocalFile {
    /// The path this handle was opened from.
    path: PathBuf,
    /// The open descriptor, if the entry could be opened without following links.
    file: Option<File>,
    /// The save options to use when building node metadata.
    save_opts: LocalSourceSaveOptions,
}

impl SourceFs for LocalFs {
    type File = LocalFile;

    fn open_file(&self, path: &Path) -> PackratResult<Self::File> {
        let meta =
            std::fs::symlink_metadata(path).map_err(LocalFsErrorKind::QueryingMetadataFailed)?;
        let file_type = meta.file_type();

        // Only regular files and dirs are opened; anything else would block
        // (fifos), connect (sockets) or fail (symlinks with O_NOFOLLOW).
        let file = if file_type.is_file() || file_type.is_dir() {
            let mut options = OpenOptions::new();
            _ = options.read(true);
            #[cfg(not(windows))]
            {
                _ = options.custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits());
            }
            Some(
                options
                    .open(path)
                    .map_err(LocalFsErrorKind::OpeningFileFailed)?,
            )
        } else {
            None
        };

        Ok(LocalFile {
            path: path.to_path_buf(),
            file,
            save_opts: self.save_opts,
        })
    }

    fn abs(&self, path: &Path) -> PackratResult<PathBuf> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(LocalFsErrorKind::DeterminingCurrentDirFailed)?
                .join(path)
        };
        Ok(path
            .parse_dot()
            .map_err(LocalFsErrorKind::CleaningPathFailed)?
            .to_path_buf())
    }
}

impl Read for LocalFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.file {
            Some(file) => file.read(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "file handle is metadata-only",
            )),
        }
    }
}

impl SourceFile for LocalFile {
    fn stat(&self, name: &OsStr) -> PackratResult<Node> {
        let meta = match &self.file {
            Some(file) => file.metadata(),
            None => std::fs::symlink_metadata(&self.path),
        }
        .map_err(LocalFsErrorKind::QueryingMetadataFailed)?;

        node_from_metadata(&self.path, name, &meta, self.save_opts)
    }

    fn read_dir_names(&self) -> PackratResult<Vec<OsString>> {
        let entries = std::fs::read_dir(&self.path)
            .map_err(LocalFsErrorKind::ReadingDirectoryFailed)?
            .map(|entry| {
                entry
                    .map(|e| e.file_name())
                    .map_err(LocalFsErrorKind::ReadingDirectoryFailed)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn make_readable(&mut self) -> PackratResult<()> {
        if self.file.is_none() {
            return Err(LocalFsErrorKind::NotReadable.into());
        }
        Ok(())
    }
}

/// Get the user name for the given uid.
#[cfg(not(windows))]
#[cached]
fn get_user_by_uid(uid: u32) -> Option<String> {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => None,
        Err(err) => {
            warn!("error getting user from uid {uid}: {err}");
            None
        }
    }
}

/// Get the group name for the given gid.
#[cfg(not(windows))]
#[cached]
fn get_group_by_gid(gid: u32) -> Option<String> {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => Some(group.name),
        Ok(None) => None,
        Err(err) => {
            warn!("error getting group from gid {gid}: {err}");
            None
        }
    }
}

/// Builds a [`Node`] from the metadata of a filesystem entry.
///
/// # Arguments
///
/// * `path` - The path of the entry, used for link targets and xattrs.
/// * `name` - The name the node will carry.
/// * `m` - The metadata of the entry.
/// * `save_opts` - Options describing which metadata to save.
#[cfg(not(windows))]
fn node_from_metadata(
    path: &Path,
    name: &OsStr,
    m: &Metadata,
    save_opts: LocalSourceSaveOptions,
) -> PackratResult<Node> {
    let uid = m.uid();
    let gid = m.gid();
    let user = get_user_by_uid(uid);
    let group = get_group_by_gid(gid);

    let mtime = m
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).with_timezone(&Local));
    let atime = if save_opts.with_atime {
        m.accessed()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).with_timezone(&Local))
    } else {
        // deterministic snapshots: fall back to mtime
        mtime
    };
    let ctime = Utc
        .timestamp_opt(
            m.ctime(),
            m.ctime_nsec()
                .try_into()
                .map_err(LocalFsErrorKind::FromTryFromIntError)?,
        )
        .single()
        .map(|dt| dt.with_timezone(&Local));

    let size = if m.is_dir() { 0 } else { m.len() };
    let mode = mapper::map_mode_to_go(m.mode());
    let inode = m.ino();
    let device_id = if save_opts.ignore_devid { 0 } else { m.dev() };
    let links = if m.is_dir() { 0 } else { m.nlink() };

    #[cfg(target_os = "openbsd")]
    let extended_attributes = Vec::new();

    #[cfg(not(target_os = "openbsd"))]
    let extended_attributes = match list_extended_attributes(path) {
        Ok(xattrs) => xattrs,
        Err(err) => {
            warn!(
                "ignoring error listing extended attributes of {}: {err}",
                path.display()
            );
            Vec::new()
        }
    };

    let meta = NodeMetadata {
        size,
        mtime,
        atime,
        ctime,
        mode: Some(mode),
        uid: Some(uid),
        gid: Some(gid),
        user,
        group,
        inode,
        device_id,
        links,
        extended_attributes,
    };

    let file_type = m.file_type();
    let node = if m.is_dir() {
        Node::new_node(name, NodeType::Dir, meta)
    } else if m.is_symlink() {
        let target = read_link(path).map_err(LocalFsErrorKind::ReadingLinkTargetFailed)?;
        Node::new_node(name, NodeType::from_link(&target), meta)
    } else if file_type.is_block_device() {
        Node::new_node(name, NodeType::Dev { device: m.rdev() }, meta)
    } else if file_type.is_char_device() {
        Node::new_node(name, NodeType::Chardev { device: m.rdev() }, meta)
    } else if file_type.is_fifo() {
        Node::new_node(name, NodeType::Fifo, meta)
    } else if file_type.is_socket() {
        Node::new_node(name, NodeType::Socket, meta)
    } else {
        Node::new_node(name, NodeType::File, meta)
    };

    Ok(node)
}

/// Builds a [`Node`] from the metadata of a filesystem entry.
#[cfg(windows)]
fn node_from_metadata(
    path: &Path,
    name: &OsStr,
    m: &Metadata,
    save_opts: LocalSourceSaveOptions,
) -> PackratResult<Node> {
    let mtime = m
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).with_timezone(&Local));
    let atime = if save_opts.with_atime {
        m.accessed()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).with_timezone(&Local))
    } else {
        mtime
    };
    let ctime = m
        .created()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).with_timezone(&Local));

    let meta = NodeMetadata {
        size: if m.is_dir() { 0 } else { m.len() },
        mtime,
        atime,
        ctime,
        ..Default::default()
    };

    let node = if m.is_dir() {
        Node::new_node(name, NodeType::Dir, meta)
    } else if m.is_symlink() {
        let target = read_link(path).map_err(LocalFsErrorKind::ReadingLinkTargetFailed)?;
        Node::new_node(name, NodeType::from_link(&target), meta)
    } else {
        Node::new_node(name, NodeType::File, meta)
    };

    Ok(node)
}

/// List the extended attributes of the entry at the given path.
#[cfg(not(any(windows, target_os = "openbsd")))]
fn list_extended_attributes(path: &Path) -> std::io::Result<Vec<ExtendedAttribute>> {
    xattr::list(path)?
        .map(|name| {
            Ok(ExtendedAttribute {
                name: name.to_string_lossy().to_string(),
                value: xattr::get(path, &name)?.unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(not(windows))]
pub mod mapper {
    const MODE_PERM: u32 = 0o777; // permission bits

    // consts from https://pkg.go.dev/io/fs#ModeType
    const GO_MODE_DIR: u32 = 0b10000000000000000000000000000000;
    const GO_MODE_SYMLINK: u32 = 0b00001000000000000000000000000000;
    const GO_MODE_DEVICE: u32 = 0b00000100000000000000000000000000;
    const GO_MODE_FIFO: u32 = 0b00000010000000000000000000000000;
    const GO_MODE_SOCKET: u32 = 0b00000001000000000000000000000000;
    const GO_MODE_SETUID: u32 = 0b00000000100000000000000000000000;
    const GO_MODE_SETGID: u32 = 0b00000000010000000000000000000000;
    const GO_MODE_CHARDEV: u32 = 0b00000000001000000000000000000000;
    const GO_MODE_STICKY: u32 = 0b00000000000100000000000000000000;
    const GO_MODE_IRREG: u32 = 0b00000000000010000000000000000000;

    // consts from man page inode(7)
    const S_IFFORMAT: u32 = 0o170000; // File mask
    const S_IFSOCK: u32 = 0o140000; // socket
    const S_IFLNK: u32 = 0o120000; // symbolic link
    const S_IFREG: u32 = 0o100000; // regular file
    const S_IFBLK: u32 = 0o060000; // block device
    const S_IFDIR: u32 = 0o040000; // directory
    const S_IFCHR: u32 = 0o020000; // character device
    const S_IFIFO: u32 = 0o010000; // FIFO

    const S_ISUID: u32 = 0o4000; // set-user-ID bit (see execve(2))
    const S_ISGID: u32 = 0o2000; // set-group-ID bit (see below)
    const S_ISVTX: u32 = 0o1000; // sticky bit (see below)

    /// map `st_mode` from POSIX (`inode(7)`) to golang's definition (<https://pkg.go.dev/io/fs#ModeType>)
    /// Note, that it only sets the bits `os.ModePerm | os.ModeType | os.ModeSetuid | os.ModeSetgid | os.ModeSticky`
    /// to stay compatible with the restic implementation
    #[must_use]
    pub const fn map_mode_to_go(mode: u32) -> u32 {
        let mut go_mode = mode & MODE_PERM;

        match mode & S_IFFORMAT {
            S_IFSOCK => go_mode |= GO_MODE_SOCKET,
            S_IFLNK => go_mode |= GO_MODE_SYMLINK,
            S_IFBLK => go_mode |= GO_MODE_DEVICE,
            S_IFDIR => go_mode |= GO_MODE_DIR,
            S_IFCHR => go_mode |= GO_MODE_CHARDEV & GO_MODE_DEVICE, // no idea why go sets both for char devices...
            S_IFIFO => go_mode |= GO_MODE_FIFO,
            // note that POSIX specifies regular files, whereas golang specifies irregular files
            S_IFREG => {}
            _ => go_mode |= GO_MODE_IRREG,
        };

        if mode & S_ISUID > 0 {
            go_mode |= GO_MODE_SETUID;
        }
        if mode & S_ISGID > 0 {
            go_mode |= GO_MODE_SETGID;
        }
        if mode & S_ISVTX > 0 {
            go_mode |= GO_MODE_STICKY;
        }

        go_mode
    }

}
