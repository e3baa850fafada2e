//! Secondary file system
//!
//! In DUAL modes the local namespace is a cache of a secondary file system
//! that stays authoritative. Calls may be slow and may fail; call sites wrap
//! failures with [`Error::secondary`](gridfs_common::Error::secondary).

use gridfs_common::{
    FsPath, PROP_GROUP_NAME, PROP_PERMISSION, PROP_USER_NAME, Properties, PropertyUpdates,
};
use std::io::{self, Read, Write};

/// Permission reported when the secondary file system has none
pub const DEFAULT_PERMISSION: u32 = 0o777;

/// Status of a path in the secondary file system
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub path: FsPath,
    pub is_dir: bool,
    pub len: u64,
    pub block_size: u64,
    pub permission: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub access_time: i64,
    pub modification_time: i64,
}

impl FileStatus {
    /// Entry properties mirroring this status
    #[must_use]
    pub fn properties(&self) -> Properties {
        let mut props = Properties::new();
        props.insert(
            PROP_PERMISSION.to_string(),
            format!("{:04o}", self.permission.unwrap_or(DEFAULT_PERMISSION)),
        );
        if let Some(owner) = &self.owner {
            props.insert(PROP_USER_NAME.to_string(), owner.clone());
        }
        if let Some(group) = &self.group {
            props.insert(PROP_GROUP_NAME.to_string(), group.clone());
        }
        props
    }
}

/// Octal permission stored under the permission property
#[must_use]
pub fn parse_permission(value: &str) -> Option<u32> {
    u32::from_str_radix(value, 8).ok()
}

/// Ownership and permission changes carried by a property update
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SecondaryAttributes<'a> {
    pub user: Option<&'a str>,
    pub group: Option<&'a str>,
    pub permission: Option<u32>,
}

impl<'a> SecondaryAttributes<'a> {
    #[must_use]
    pub fn from_updates(updates: &'a PropertyUpdates) -> Self {
        let value = |key: &str| updates.get(key).and_then(Option::as_deref);

        Self {
            user: value(PROP_USER_NAME),
            group: value(PROP_GROUP_NAME),
            permission: value(PROP_PERMISSION).and_then(parse_permission),
        }
    }
}

/// Secondary file system client
pub trait SecondaryFs: Send + Sync {
    /// Status of `path`, `None` when it does not exist.
    fn status(&self, path: &FsPath) -> io::Result<Option<FileStatus>>;

    /// Status of the children of `path`, `None` when it does not exist.
    fn list_status(&self, path: &FsPath) -> io::Result<Option<Vec<FileStatus>>>;

    fn exists(&self, path: &FsPath) -> io::Result<bool> {
        Ok(self.status(path)?.is_some())
    }

    /// Create a file, creating missing parents.
    fn create(&self, path: &FsPath, overwrite: bool) -> io::Result<Box<dyn Write + Send>>;

    fn append(&self, path: &FsPath) -> io::Result<Box<dyn Write + Send>>;

    fn open(&self, path: &FsPath) -> io::Result<Box<dyn Read + Send>>;

    /// Rename `src`. When `dest` is an existing directory `src` is moved
    /// into it. Returns `false` when nothing was renamed.
    fn rename(&self, src: &FsPath, dest: &FsPath) -> io::Result<bool>;

    /// Returns `false` when the path does not exist.
    fn delete(&self, path: &FsPath, recursive: bool) -> io::Result<bool>;

    fn mkdirs(&self, path: &FsPath, permission: Option<u32>) -> io::Result<bool>;

    fn set_owner(&self, path: &FsPath, user: Option<&str>, group: Option<&str>)
    -> io::Result<()>;

    fn set_permission(&self, path: &FsPath, permission: u32) -> io::Result<()>;
}

#[cfg(unix)]
pub use local::LocalSecondaryFs;

#[cfg(unix)]
mod local {
    use super::{FileStatus, SecondaryFs};
    use gridfs_common::FsPath;
    use nix::unistd::{Gid, Group, Uid, User, chown};
    use std::fs::{self, File, OpenOptions, Permissions};
    use std::io::{self, Read, Write};
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use std::path::{Path, PathBuf};

    /// Secondary file system rooted at a local directory
    pub struct LocalSecondaryFs {
        root: PathBuf,
    }

    impl LocalSecondaryFs {
        pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
            let root = root.into();
            fs::create_dir_all(&root)?;
            Ok(Self { root })
        }

        #[must_use]
        pub fn root(&self) -> &Path {
            &self.root
        }

        fn local(&self, path: &FsPath) -> PathBuf {
            let mut local = self.root.clone();
            for component in path.components() {
                local.push(component);
            }
            local
        }

        fn to_status(path: FsPath, md: &fs::Metadata) -> FileStatus {
            FileStatus {
                path,
                is_dir: md.is_dir(),
                len: if md.is_dir() { 0 } else { md.len() },
                block_size: md.blksize(),
                permission: Some(md.mode() & 0o7777),
                owner: Some(
                    User::from_uid(Uid::from_raw(md.uid()))
                        .ok()
                        .flatten()
                        .map_or_else(|| md.uid().to_string(), |u| u.name),
                ),
                group: Some(
                    Group::from_gid(Gid::from_raw(md.gid()))
                        .ok()
                        .flatten()
                        .map_or_else(|| md.gid().to_string(), |g| g.name),
                ),
                access_time: md.atime().saturating_mul(1000),
                modification_time: md.mtime().saturating_mul(1000),
            }
        }

        fn metadata(path: &Path) -> io::Result<Option<fs::Metadata>> {
            match fs::metadata(path) {
                Ok(md) => Ok(Some(md)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        }

        fn resolve_user(name: &str) -> io::Result<Uid> {
            if let Some(user) = User::from_name(name).map_err(io::Error::from)? {
                return Ok(user.uid);
            }
            name.parse::<u32>().map(Uid::from_raw).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unknown user: {name}"))
            })
        }

        fn resolve_group(name: &str) -> io::Result<Gid> {
            if let Some(group) = Group::from_name(name).map_err(io::Error::from)? {
                return Ok(group.gid);
            }
            name.parse::<u32>().map(Gid::from_raw).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, format!("unknown group: {name}"))
            })
        }
    }

    impl SecondaryFs for LocalSecondaryFs {
        fn status(&self, path: &FsPath) -> io::Result<Option<FileStatus>> {
            Ok(Self::metadata(&self.local(path))?.map(|md| Self::to_status(path.clone(), &md)))
        }

        fn list_status(&self, path: &FsPath) -> io::Result<Option<Vec<FileStatus>>> {
            let local = self.local(path);
            let Some(md) = Self::metadata(&local)? else {
                return Ok(None);
            };
            if !md.is_dir() {
                return Ok(Some(vec![Self::to_status(path.clone(), &md)]));
            }

            let mut statuses = Vec::new();
            for dirent in fs::read_dir(&local)? {
                let dirent = dirent?;
                let name = dirent.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                let child = path
                    .child(name)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                statuses.push(Self::to_status(child, &dirent.metadata()?));
            }
            statuses.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(Some(statuses))
        }

        fn create(&self, path: &FsPath, overwrite: bool) -> io::Result<Box<dyn Write + Send>> {
            let local = self.local(path);
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut options = OpenOptions::new();
            options.write(true);
            if overwrite {
                options.create(true).truncate(true);
            } else {
                options.create_new(true);
            }
            Ok(Box::new(options.open(local)?))
        }

        fn append(&self, path: &FsPath) -> io::Result<Box<dyn Write + Send>> {
            let file = OpenOptions::new().append(true).open(self.local(path))?;
            Ok(Box::new(file))
        }

        fn open(&self, path: &FsPath) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(File::open(self.local(path))?))
        }

        fn rename(&self, src: &FsPath, dest: &FsPath) -> io::Result<bool> {
            let src_local = self.local(src);
            if src.is_root() || Self::metadata(&src_local)?.is_none() {
                return Ok(false);
            }

            let mut dest_local = self.local(dest);
            match Self::metadata(&dest_local)? {
                Some(md) if md.is_dir() => dest_local.push(src.name()),
                Some(_) => return Ok(false),
                None => {}
            }

            if Self::metadata(&dest_local)?.is_some() {
                return Ok(false);
            }
            match dest_local.parent().map(Self::metadata).transpose()?.flatten() {
                Some(md) if md.is_dir() => {}
                _ => return Ok(false),
            }

            fs::rename(src_local, dest_local)?;
            Ok(true)
        }

        fn delete(&self, path: &FsPath, recursive: bool) -> io::Result<bool> {
            let local = self.local(path);
            let Some(md) = Self::metadata(&local)? else {
                return Ok(false);
            };

            if !md.is_dir() {
                fs::remove_file(local)?;
            } else if path.is_root() {
                for dirent in fs::read_dir(&local)? {
                    let child = dirent?.path();
                    if !recursive {
                        return Err(io::Error::other(format!(
                            "directory is not empty: {path}"
                        )));
                    }
                    if child.is_dir() {
                        fs::remove_dir_all(child)?;
                    } else {
                        fs::remove_file(child)?;
                    }
                }
            } else if recursive {
                fs::remove_dir_all(local)?;
            } else {
                fs::remove_dir(local)?;
            }
            Ok(true)
        }

        fn mkdirs(&self, path: &FsPath, permission: Option<u32>) -> io::Result<bool> {
            let local = self.local(path);
            fs::create_dir_all(&local)?;
            if let Some(mode) = permission {
                fs::set_permissions(&local, Permissions::from_mode(mode))?;
            }
            Ok(true)
        }

        fn set_owner(
            &self,
            path: &FsPath,
            user: Option<&str>,
            group: Option<&str>,
        ) -> io::Result<()> {
            let uid = user.map(Self::resolve_user).transpose()?;
            let gid = group.map(Self::resolve_group).transpose()?;
            chown(&self.local(path), uid, gid).map_err(io::Error::from)
        }

        fn set_permission(&self, path: &FsPath, permission: u32) -> io::Result<()> {
            fs::set_permissions(self.local(path), Permissions::from_mode(permission))
        }
    }
}
