use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository, Signature};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{ChangedFile, DiffProvider};

/// Paths under this prefix belong to anvil itself and never count as changes.
const STATE_DIR_PREFIX: &str = ".anvil/";

/// `DiffProvider` over a local git repository.
///
/// The repository is reopened per call so the provider stays `Send + Sync`.
pub struct GitDiffProvider {
    project_dir: PathBuf,
}

impl GitDiffProvider {
    pub fn new(project_dir: &Path) -> Result<Self> {
        Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.project_dir).context("Failed to open git repository")
    }

    /// HEAD commit, or None on an unborn branch.
    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Signature::now("anvil", "anvil@localhost").context("Failed to build signature"),
        }
    }
}

impl DiffProvider for GitDiffProvider {
    fn changed_files(&self) -> Result<Vec<ChangedFile>> {
        let repo = self.repo()?;
        let head_tree = match Self::head_commit(&repo) {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree")?;

        let mut files: BTreeMap<String, ChangedFile> = BTreeMap::new();
        let mut untracked: Vec<String> = Vec::new();

        for delta in diff.deltas() {
            let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) else {
                continue;
            };
            let path = path.to_string_lossy().to_string();
            if path.starts_with(STATE_DIR_PREFIX) {
                continue;
            }
            if delta.status() == Delta::Untracked {
                untracked.push(path.clone());
            }
            files.entry(path.clone()).or_insert_with(|| ChangedFile::new(&path));
        }

        diff.foreach(
            &mut |_delta, _progress| true,
            None,
            None,
            Some(&mut |delta, _hunk, line| {
                let path = delta.new_file().path().or_else(|| delta.old_file().path());
                let Some(path) = path.map(|p| p.to_string_lossy().to_string()) else {
                    return true;
                };
                let Some(file) = files.get_mut(&path) else {
                    return true;
                };
                match line.origin() {
                    '+' => {
                        file.lines_added += 1;
                        file.added_lines.push((
                            line.new_lineno().unwrap_or(0),
                            String::from_utf8_lossy(line.content()).trim_end_matches('\n').to_string(),
                        ));
                    }
                    '-' => file.lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )
        .context("Failed to walk diff")?;

        // Untracked files carry no hunks; their whole content is added.
        for path in untracked {
            let Ok(content) = std::fs::read(self.project_dir.join(&path)) else {
                continue;
            };
            if let Some(file) = files.get_mut(&path) {
                for (i, text) in String::from_utf8_lossy(&content).lines().enumerate() {
                    file.lines_added += 1;
                    file.added_lines.push((i as u32 + 1, text.to_string()));
                }
            }
        }

        Ok(files.into_values().collect())
    }

    fn commit(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        // Stage deletions too.
        index.update_all(["*"].iter(), None)?;
        for entry in [".anvil", ".anvil/*"] {
            index.remove_all([entry].iter(), None).ok();
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let parents: Vec<git2::Commit<'_>> = Self::head_commit(&repo).into_iter().collect();
        let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();

        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
            .context("Failed to create commit")?;
        Ok(oid.to_string())
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let repo = self.repo()?;
        let head = Self::head_commit(&repo).context("Cannot branch from an unborn HEAD")?;
        repo.branch(name, &head, false)
            .with_context(|| format!("Failed to create branch {}", name))?;
        // Uncommitted work stays in the working tree, like `git checkout -b`.
        repo.set_head(&format!("refs/heads/{}", name))
            .with_context(|| format!("Failed to switch to branch {}", name))?;
        Ok(())
    }

    fn current_branch(&self) -> Result<Option<String>> {
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(h) => h,
            Err(_) => return Ok(None),
        };
        Ok(head.shorthand().map(str::to_string))
    }

    fn is_clean(&self) -> Result<bool> {
        Ok(self.changed_files()?.is_empty())
    }
}
