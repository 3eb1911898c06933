//! Collection and classification of file overlaps during artifact staging.
//!
//! Every `stage()` invocation opens one collection session. Staged results
//! are accumulated per element; when the session closes, files written by
//! more than one element are classified: whitelisted overlaps stay silent,
//! non-whitelisted ones raise an `overlaps` warning (fatal when configured),
//! files that would have replaced non-empty directories raise
//! `unstaged-files`, and overlaps against *previous* sessions follow the
//! caller's requested action.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;

use kiln_cas::tree::FileListResult;
use kiln_types::{Error, ErrorKind, Result};

use crate::variables::Variables;

/// What to do about overlaps with previously staged sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapAction {
    Error,
    Warning,
    Ignore,
}

/// Warning tokens the collector can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreWarning {
    Overlaps,
    UnstagedFiles,
}

impl CoreWarning {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreWarning::Overlaps => "overlaps",
            CoreWarning::UnstagedFiles => "unstaged-files",
        }
    }
}

/// A warning produced at session close; the caller decides fatality against
/// the element's fatal-warnings configuration.
#[derive(Debug, Clone)]
pub struct OverlapWarning {
    pub token: CoreWarning,
    pub brief: String,
    pub detail: String,
}

/// Identity and whitelist of one staged element.
pub struct StagedProvenance {
    pub name: String,
    pub whitelist: Option<GlobSet>,
}

impl StagedProvenance {
    fn is_whitelisted(&self, filename: &str) -> bool {
        match &self.whitelist {
            Some(set) => set.is_match(absolute(filename)),
            None => false,
        }
    }
}

fn absolute(filename: &str) -> String {
    if filename.starts_with('/') {
        filename.to_string()
    } else {
        format!("/{}", filename)
    }
}

struct Session {
    action: OverlapAction,
    location: String,
    staged: Vec<(StagedProvenance, Vec<String>)>,
    ignored: Vec<(String, Vec<String>)>,
    /// file → ordered staged-element indexes; the first entry is the
    /// bottom-most writer within this session.
    overlaps: Vec<(String, Vec<usize>)>,
}

impl Session {
    fn find_overlap(&mut self, file: &str) -> Option<&mut Vec<usize>> {
        self.overlaps
            .iter_mut()
            .find(|(f, _)| f == file)
            .map(|(_, list)| list)
    }
}

/// Collects results of staging artifacts for one element.
#[derive(Default)]
pub struct OverlapCollector {
    sessions: Vec<Session>,
    current: Option<Session>,
}

impl OverlapCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a collection session for staging into `location`.
    pub fn begin_session(&mut self, action: OverlapAction, location: &str) {
        debug_assert!(self.current.is_none(), "stage session already started");
        self.current = Some(Session {
            action,
            location: if location.is_empty() {
                "/".to_string()
            } else {
                location.to_string()
            },
            staged: Vec::new(),
            ignored: Vec::new(),
            overlaps: Vec::new(),
        });
    }

    /// Record one staged artifact result within the open session.
    pub fn collect_stage_result(&mut self, provenance: StagedProvenance, result: &FileListResult) {
        let session = self
            .current
            .as_mut()
            .expect("staging files outside of staging session");

        let index = session.staged.len();
        for overwritten in &result.overwritten {
            if session.find_overlap(overwritten).is_none() {
                // Start the list with the bottom-most element staged in this
                // session, when there is one.
                let bottom = session
                    .staged
                    .iter()
                    .position(|(_, files)| files.contains(overwritten));
                session
                    .overlaps
                    .push((overwritten.clone(), bottom.into_iter().collect()));
            }
            if let Some(list) = session.find_overlap(overwritten) {
                list.push(index);
            }
        }

        if !result.ignored.is_empty() {
            session
                .ignored
                .push((provenance.name.clone(), result.ignored.clone()));
        }
        session.staged.push((provenance, result.files_written.clone()));
    }

    /// Close the session, producing warnings. Overlaps against previous
    /// sessions with [`OverlapAction::Error`] surface as a fatal `overlaps`
    /// error.
    pub fn end_session(&mut self) -> Result<Vec<OverlapWarning>> {
        let session = self.current.take().expect("no staging session open");
        let mut warnings = Vec::new();

        // (filename, element index) pairs that overlapped something staged
        // outside this session.
        let mut external: Vec<(String, usize)> = Vec::new();

        let mut overlap_warning = false;
        let mut overlap_detail = format!(
            "Staged files overwrite existing files in staging area: {}\n",
            session.location
        );
        for (filename, indexes) in &session.overlaps {
            if indexes.len() == 1 {
                external.push((filename.clone(), indexes[0]));
                continue;
            }

            // The bottom-most element does not overlap anything; filter the
            // whitelisted ones out of the rest.
            let offenders: Vec<&StagedProvenance> = indexes[1..]
                .iter()
                .map(|i| &session.staged[*i].0)
                .filter(|p| !p.is_whitelisted(filename))
                .collect();
            if !offenders.is_empty() {
                overlap_warning = true;
            }

            let order: Vec<&str> = indexes
                .iter()
                .map(|i| session.staged[*i].0.name.as_str())
                .collect();
            let offender_names: Vec<&str> = offenders.iter().map(|p| p.name.as_str()).collect();
            if offender_names.is_empty() {
                overlap_detail.push_str(&format!(
                    "{}/{}: whitelisted overlap, order {}\n",
                    session.location.trim_end_matches('/'),
                    filename,
                    order.join(" -> ")
                ));
            } else {
                overlap_detail.push_str(&format!(
                    "{}/{}: {} not permitted to overlap other elements, order {}\n",
                    session.location.trim_end_matches('/'),
                    filename,
                    offender_names.join(" and "),
                    order.join(" -> ")
                ));
            }
        }
        if overlap_warning {
            warnings.push(OverlapWarning {
                token: CoreWarning::Overlaps,
                brief: "Non-whitelisted overlaps detected".to_string(),
                detail: overlap_detail,
            });
        }

        if !session.ignored.is_empty() {
            let mut detail = format!(
                "Not staging files which would replace non-empty directories in staging area: {}\n",
                session.location
            );
            for (name, files) in &session.ignored {
                detail.push_str(&format!("\nFrom {}:\n", name));
                for file in files {
                    detail.push_str(&format!(
                        "  {}/{}\n",
                        session.location.trim_end_matches('/'),
                        file
                    ));
                }
            }
            warnings.push(OverlapWarning {
                token: CoreWarning::UnstagedFiles,
                brief: "Not staging files which would have replaced non-empty directories"
                    .to_string(),
                detail,
            });
        }

        if !external.is_empty() && session.action != OverlapAction::Ignore {
            let mut detail = format!(
                "Detected file overlaps while staging elements into: {}\n",
                session.location
            );
            for (filename, index) in &external {
                let name = &session.staged[*index].0.name;
                match self.search_previous(filename) {
                    Some((previous, location)) => detail.push_str(&format!(
                        "{}/{}: {} overlaps files previously staged by {} in: {}\n",
                        session.location.trim_end_matches('/'),
                        filename,
                        name,
                        previous,
                        location
                    )),
                    None => detail.push_str(&format!(
                        "{}/{}: {} overlaps previously staged files\n",
                        session.location.trim_end_matches('/'),
                        filename,
                        name
                    )),
                }
            }

            match session.action {
                OverlapAction::Error => {
                    self.sessions.push(session);
                    return Err(Error::new(
                        ErrorKind::Overlap,
                        "overlaps",
                        "Overlaps detected",
                    )
                    .with_detail(detail));
                }
                OverlapAction::Warning => warnings.push(OverlapWarning {
                    token: CoreWarning::Overlaps,
                    brief: "Overlaps detected".to_string(),
                    detail,
                }),
                OverlapAction::Ignore => {}
            }
        }

        self.sessions.push(session);
        Ok(warnings)
    }

    fn search_previous(&self, filename: &str) -> Option<(String, String)> {
        for session in self.sessions.iter().rev() {
            for (provenance, files) in &session.staged {
                if files.iter().any(|f| f == filename) {
                    return Some((provenance.name.clone(), session.location.clone()));
                }
            }
        }
        None
    }
}

/// Compile whitelist globs from an element's `public.bst.overlap-whitelist`
/// list, variable-expanded and anchored.
pub fn whitelist_from_public(public: &Value, vars: &Variables) -> Result<Option<GlobSet>> {
    let Some(patterns) = public
        .get("bst")
        .and_then(|bst| bst.get("overlap-whitelist"))
        .and_then(Value::as_array)
    else {
        return Ok(None);
    };

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let pattern = pattern.as_str().ok_or_else(|| {
            Error::new(
                ErrorKind::Load,
                "invalid-whitelist",
                "overlap-whitelist entries must be strings",
            )
        })?;
        let expanded = vars.expand(pattern)?;
        let glob = Glob::new(&absolute(&expanded)).map_err(|e| {
            Error::new(
                ErrorKind::Load,
                "invalid-whitelist",
                format!("invalid overlap-whitelist glob '{}': {}", expanded, e),
            )
        })?;
        builder.add(glob);
    }
    let set = builder.build().map_err(|e| {
        Error::new(
            ErrorKind::Load,
            "invalid-whitelist",
            format!("failed to compile overlap whitelist: {}", e),
        )
    })?;
    Ok(Some(set))
}
