use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use chrono::{DateTime, Duration, Local};
use derivative::Derivative;
use derive_setters::Setters;
use dunce::canonicalize;
use gethostname::gethostname;
use path_dedot::ParseDot;
use serde_derive::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};

use crate::{
    error::SnapshotFileErrorKind, id::Id, PackratError, PackratResult,
};

#[serde_as]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Deserialize, Serialize, Clone, Default, Debug, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into, strip_option)]
/// Options for creating a new [`SnapshotFile`] structure for a new backup snapshot.
pub struct SnapshotOptions {
    /// Label snapshot with given label
    #[cfg_attr(feature = "clap", clap(long, value_name = "LABEL"))]
    pub label: Option<String>,

    /// Tags to add to snapshot (can be specified multiple times)
    #[cfg_attr(feature = "clap", clap(long = "tag", value_name = "TAG[,TAG,..]"))]
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub tags: Vec<StringList>,

    /// Add description to snapshot
    #[cfg_attr(feature = "clap", clap(long, value_name = "DESCRIPTION"))]
    pub description: Option<String>,

    /// Add description to snapshot from file
    #[cfg_attr(
        feature = "clap",
        clap(long, value_name = "FILE", conflicts_with = "description")
    )]
    pub description_from: Option<PathBuf>,

    /// Set the backup time manually
    pub time: Option<DateTime<Local>>,

    /// Mark snapshot as uneraseable
    #[cfg_attr(feature = "clap", clap(long, conflicts_with = "delete_after"))]
    pub delete_never: bool,

    /// Mark snapshot to be deleted after given duration (e.g. 10d)
    #[cfg_attr(feature = "clap", clap(long, value_name = "DURATION"))]
    #[serde_as(as = "Option<DisplayFromStr>")]
    pub delete_after: Option<humantime::Duration>,

    /// Set the host name manually
    #[cfg_attr(feature = "clap", clap(long, value_name = "NAME"))]
    pub host: Option<String>,

    /// Set the backup command manually
    #[cfg_attr(feature = "clap", clap(long))]
    pub command: Option<String>,
}

impl SnapshotOptions {
    /// Add a tag list to this [`SnapshotOptions`]
    ///
    /// # Errors
    ///
    /// This never fails; the `Result` mirrors [`StringList::from_str`].
    pub fn add_tags(mut self, tag: &str) -> PackratResult<Self> {
        self.tags.push(StringList::from_str(tag)?);
        Ok(self)
    }

    /// Create a new [`SnapshotFile`] using this `SnapshotOptions`
    ///
    /// # Errors
    ///
    /// * If the hostname is not valid unicode
    pub fn to_snapshot(&self) -> PackratResult<SnapshotFile> {
        SnapshotFile::new_from_options(self)
    }
}

/// Summary information about a snapshot.
///
/// This is an extended version of the summaryOutput structure of restic in
/// restic/internal/ui/backup/json.go
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Derivative)]
#[derivative(Default)]
pub struct SnapshotSummary {
    /// New files compared to the parent snapshot
    pub files_new: u64,
    /// Changed files compared to the parent snapshot
    pub files_changed: u64,
    /// Unchanged files compared to the parent snapshot
    pub files_unmodified: u64,
    /// New directories compared to the parent snapshot
    pub dirs_new: u64,
    /// Changed directories compared to the parent snapshot
    pub dirs_changed: u64,
    /// Unchanged directories compared to the parent snapshot
    pub dirs_unmodified: u64,
    /// Total number of data blobs added by this snapshot
    pub data_blobs: u64,
    /// Total number of tree blobs added by this snapshot
    pub tree_blobs: u64,
    /// Total uncompressed bytes added by this snapshot
    pub data_added: u64,
    /// Total bytes added to the repository by this snapshot
    pub data_added_packed: u64,
    /// Total uncompressed bytes (new/changed files) added by this snapshot
    pub data_added_files: u64,
    /// Total bytes for new/changed files added to the repository by this snapshot
    pub data_added_files_packed: u64,
    /// Total uncompressed bytes (new/changed directories) added by this snapshot
    pub data_added_trees: u64,
    /// Total bytes (new/changed directories) added to the repository by this snapshot
    pub data_added_trees_packed: u64,
    /// Total processed files
    pub total_files_processed: u64,
    /// Total processed directories
    pub total_dirs_processed: u64,
    /// Total size of all processed files
    pub total_bytes_processed: u64,
    /// Total size of all processed directories
    pub total_dirsize_processed: u64,
    /// Total duration that the backup command ran, in seconds
    pub total_duration: f64,

    /// The command used to make this backup
    pub command: String,
    /// Start time of the backup
    #[derivative(Default(value = "Local::now()"))]
    pub backup_start: DateTime<Local>,
    /// End time of the backup
    #[derivative(Default(value = "Local::now()"))]
    pub backup_end: DateTime<Local>,
    /// Duration of the backup in seconds, i.e. the time between `backup_start` and `backup_end`
    pub backup_duration: f64,
}

impl SnapshotSummary {
    /// Fill in the end time and the duration fields.
    ///
    /// # Arguments
    ///
    /// * `snap_time` - The time of the snapshot
    ///
    /// # Errors
    ///
    /// * [`SnapshotFileErrorKind::OutOfRange`] - If the time is not in the range of `Local::now()`
    ///
    /// [`SnapshotFileErrorKind::OutOfRange`]: crate::error::SnapshotFileErrorKind::OutOfRange
    pub(crate) fn finalize(&mut self, snap_time: DateTime<Local>) -> PackratResult<()> {
        let end_time = Local::now();
        self.backup_duration = (end_time - self.backup_start)
            .to_std()
            .map_err(SnapshotFileErrorKind::OutOfRange)?
            .as_secs_f64();
        self.total_duration = (end_time - snap_time)
            .to_std()
            .map_err(SnapshotFileErrorKind::OutOfRange)?
            .as_secs_f64();
        self.backup_end = end_time;
        Ok(())
    }
}

/// Options for deletion of a snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Derivative, Copy)]
#[derivative(Default)]
pub enum DeleteOption {
    /// No delete option set.
    #[derivative(Default)]
    NotSet,
    /// This snapshot should never be deleted (remove-protection).
    Never,
    /// Remove this snapshot after the given timestamp, but prevent removing it before.
    After(DateTime<Local>),
}

impl DeleteOption {
    const fn is_not_set(&self) -> bool {
        matches!(self, Self::NotSet)
    }
}

#[serde_with::apply(Option => #[serde(default, skip_serializing_if = "Option::is_none")])]
#[derive(Debug, Clone, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
/// A [`SnapshotFile`] is the repository representation of the snapshot metadata.
///
/// It is usually saved in the repository under `snapshot/<ID>`
pub struct SnapshotFile {
    /// Timestamp of this snapshot
    #[derivative(Default(value = "Local::now()"))]
    pub time: DateTime<Local>,
    /// Program identifier and its version that have been used to create this snapshot.
    #[derivative(Default(
        value = "\"packrat \".to_string() + env!(\"CARGO_PKG_VERSION\")"
    ))]
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub program_version: String,
    /// The Id of the parent snapshot that this snapshot has been based on
    pub parent: Option<Id>,
    /// The tree blob id where the contents of this snapshot are stored
    pub tree: Id,
    /// Label for the snapshot
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// The list of paths contained in this snapshot
    pub paths: StringList,
    /// The hostname of the device on which the snapshot has been created
    #[serde(default)]
    pub hostname: String,
    /// The username that started the backup run
    #[serde(default)]
    pub username: String,
    /// The uid of the username that started the backup run
    #[serde(default)]
    pub uid: u32,
    /// The gid of the username that started the backup run
    #[serde(default)]
    pub gid: u32,
    /// The exclude patterns which were in effect for this snapshot
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excludes: Vec<String>,
    /// A list of tags for this snapshot
    #[serde(default)]
    pub tags: StringList,
    /// The original Id of this snapshot. This is stored when the snapshot is modified.
    pub original: Option<Id>,
    /// Options for deletion of the snapshot
    #[serde(default, skip_serializing_if = "DeleteOption::is_not_set")]
    pub delete: DeleteOption,

    /// Summary information about the backup run
    pub summary: Option<SnapshotSummary>,
    /// A description of what is contained in this snapshot
    pub description: Option<String>,

    /// The snapshot Id (not stored within the JSON)
    #[serde(default, skip_serializing_if = "Id::is_null")]
    pub id: Id,
}

impl SnapshotFile {
    /// Create a [`SnapshotFile`] from [`SnapshotOptions`].
    ///
    /// Fills hostname, username, uid and gid from the environment unless
    /// overridden by the options.
    ///
    /// # Errors
    ///
    /// * [`SnapshotFileErrorKind::NonUnicodeHostname`] - If the hostname is not valid unicode
    ///
    /// [`SnapshotFileErrorKind::NonUnicodeHostname`]: crate::error::SnapshotFileErrorKind::NonUnicodeHostname
    pub fn new_from_options(opts: &SnapshotOptions) -> PackratResult<Self> {
        let hostname = if let Some(ref host) = opts.host {
            host.clone()
        } else {
            let hostname = gethostname();
            hostname
                .to_str()
                .ok_or_else(|| SnapshotFileErrorKind::NonUnicodeHostname(hostname.clone()))?
                .to_string()
        };

        let time = opts.time.unwrap_or_else(Local::now);

        let delete = match (opts.delete_never, opts.delete_after) {
            (true, _) => DeleteOption::Never,
            (_, Some(d)) => DeleteOption::After(
                time + Duration::from_std(*d).map_err(SnapshotFileErrorKind::OutOfRange)?,
            ),
            (false, None) => DeleteOption::NotSet,
        };

        let mut snap = Self {
            time,
            hostname,
            label: opts.label.clone().unwrap_or_default(),
            delete,
            summary: Some(SnapshotSummary {
                command: opts.command.clone().unwrap_or_default(),
                ..Default::default()
            }),
            description: opts.description.clone(),
            ..Default::default()
        };

        #[cfg(not(windows))]
        {
            let uid = nix::unistd::Uid::effective();
            snap.uid = uid.as_raw();
            snap.gid = nix::unistd::Gid::effective().as_raw();
            if let Ok(Some(user)) = nix::unistd::User::from_uid(uid) {
                snap.username = user.name;
            }
        }

        // use description from description file if it is given
        if let Some(ref file) = opts.description_from {
            snap.description = Some(
                std::fs::read_to_string(file)
                    .map_err(SnapshotFileErrorKind::ReadingDescriptionFailed)?,
            );
        }

        _ = snap.set_tags(opts.tags.clone());

        Ok(snap)
    }

    /// Add tag lists to this snapshot.
    ///
    /// # Returns
    ///
    /// Whether the tags were changed.
    pub fn add_tags(&mut self, tag_lists: Vec<StringList>) -> bool {
        let old_tags = self.tags.clone();
        self.tags.add_all(tag_lists);
        self.tags.sort();

        old_tags != self.tags
    }

    /// Set the tag lists of this snapshot.
    ///
    /// # Returns
    ///
    /// Whether the tags were changed.
    pub fn set_tags(&mut self, tag_lists: Vec<StringList>) -> bool {
        let old_tags = std::mem::take(&mut self.tags);
        self.tags.add_all(tag_lists);
        self.tags.sort();

        old_tags != self.tags
    }
}

/// A list of strings, used for tags and the path list of a snapshot.
#[derive(Serialize, Deserialize, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct StringList(Vec<String>);

impl FromStr for StringList {
    type Err = PackratError;
    fn from_str(s: &str) -> PackratResult<Self> {
        Ok(Self(
            s.split(',').map(std::string::ToString::to_string).collect(),
        ))
    }
}

impl Display for StringList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))?;
        Ok(())
    }
}

impl StringList {
    fn contains(&self, s: &String) -> bool {
        self.0.contains(s)
    }

    fn add(&mut self, s: String) {
        if !self.contains(&s) {
            self.0.push(s);
        }
    }

    fn add_list(&mut self, sl: Self) {
        for s in sl.0 {
            self.add(s);
        }
    }

    fn add_all(&mut self, string_lists: Vec<Self>) {
        for sl in string_lists {
            self.add_list(sl);
        }
    }

    /// Set the strings to the given paths.
    ///
    /// # Errors
    ///
    /// * [`SnapshotFileErrorKind::NonUnicodePath`] - If a path is not valid unicode
    ///
    /// [`SnapshotFileErrorKind::NonUnicodePath`]: crate::error::SnapshotFileErrorKind::NonUnicodePath
    pub fn set_paths<T: AsRef<std::path::Path>>(&mut self, paths: &[T]) -> PackratResult<()> {
        self.0 = paths
            .iter()
            .map(|p| {
                Ok(p.as_ref()
                    .to_str()
                    .ok_or_else(|| SnapshotFileErrorKind::NonUnicodePath(p.as_ref().into()))?
                    .to_string())
            })
            .collect::<PackratResult<Vec<_>>>()?;
        Ok(())
    }

    fn sort(&mut self) {
        self.0.sort_unstable();
    }

    /// Format this [`StringList`] using newlines
    #[must_use]
    pub fn formatln(&self) -> String {
        self.0.join("\n")
    }

    /// Iterate over the contained strings
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }
}

/// A list of paths to back up.
#[derive(Default, Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct PathList(Vec<PathBuf>);

impl Display for PathList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((first, rest)) = self.0.split_first() {
            write!(f, "{first:?}")?;
            for p in rest {
                write!(f, ",{p:?}")?;
            }
        }
        Ok(())
    }
}

impl PathList {
    /// Create a `PathList` from `String`s.
    ///
    /// # Arguments
    ///
    /// * `source` - The `String`s to use
    pub fn from_strings<I>(source: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self(
            source
                .into_iter()
                .map(|source| PathBuf::from(source.as_ref()))
                .collect(),
        )
    }

    /// Number of paths in the list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the path list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Clone the contained paths.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.0.clone()
    }

    /// Sanitize paths: remove dots and absolutize if needed.
    ///
    /// # Errors
    ///
    /// * [`SnapshotFileErrorKind::RemovingDotsFromPathFailed`] - If removing dots from a path failed
    /// * [`SnapshotFileErrorKind::CanonicalizingPathFailed`] - If canonicalizing a path failed
    ///
    /// [`SnapshotFileErrorKind::RemovingDotsFromPathFailed`]: crate::error::SnapshotFileErrorKind::RemovingDotsFromPathFailed
    /// [`SnapshotFileErrorKind::CanonicalizingPathFailed`]: crate::error::SnapshotFileErrorKind::CanonicalizingPathFailed
    pub fn sanitize(mut self) -> PackratResult<Self> {
        for path in &mut self.0 {
            *path = path
                .parse_dot()
                .map_err(SnapshotFileErrorKind::RemovingDotsFromPathFailed)?
                .to_path_buf();
        }
        if self.0.iter().any(|p| p.is_absolute()) {
            for path in &mut self.0 {
                *path =
                    canonicalize(&path).map_err(SnapshotFileErrorKind::CanonicalizingPathFailed)?;
            }
        }
        Ok(self)
    }

    /// Sort paths and filter out subpaths of already existing paths.
    #[must_use]
    pub fn merge(mut self) -> Self {
        // sort paths
        self.0.sort_unstable();

        let mut root_path = None;

        // filter out subpaths
        self.0.retain(|path| match &root_path {
            Some(root_path) if path.starts_with(root_path) => false,
            _ => {
                root_path = Some(path.clone());
                true
            }
        });

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_new_from_options_fills_host_and_time_passes() {
        let time = Local::now();
        let opts = SnapshotOptions::default()
            .host("testhost")
            .time(time)
            .command("packrat backup".to_string());

        let snap = opts.to_snapshot().unwrap();

        assert_eq!(snap.hostname, "testhost");
        assert_eq!(snap.time, time);
        assert_eq!(snap.summary.unwrap().command, "packrat backup");
    }

    #[test]
    fn test_add_tags_dedups_passes() {
        let opts = SnapshotOptions::default()
            .add_tags("foo,bar")
            .unwrap()
            .add_tags("bar,baz")
            .unwrap();

        let snap = opts.to_snapshot().unwrap();

        assert_eq!(snap.tags.formatln(), "bar\nbaz\nfoo");
    }

    #[rstest]
    #[case(&["/base", "/base/sub", "/other"], &["/base", "/other"])]
    #[case(&["/a/b", "/a", "/a/c"], &["/a"])]
    #[case(&["/a", "/ab"], &["/a", "/ab"])]
    fn test_merge_paths_passes(#[case] input: &[&str], #[case] expected: &[&str]) {
        let merged = PathList::from_strings(input).merge();

        assert_eq!(merged, PathList::from_strings(expected));
    }

    #[test]
    fn test_snapshot_serialization_skips_empty_fields_passes() {
        let snap = SnapshotFile {
            program_version: String::new(),
            ..Default::default()
        };
        let json = serde_json::to_string(&snap).unwrap();

        assert!(!json.contains("program_version"));
        assert!(!json.contains("excludes"));
        assert!(!json.contains("\"id\""));
    }
}
