//! Local git operations for work branches.
//!
//! Provides base resolution, branch ownership checks, branch creation/reuse,
//! staging and committing. Pushing lives in `push`.

use anyhow::{Context, Result};
use git2::{BranchType, ObjectType, Oid, Repository, Signature};
use std::path::Path;

/// Trailer carried by every commit the pipeline creates.
pub const OWNERSHIP_TRAILER_KEY: &str = "Remediated-By";
pub const OWNERSHIP_TRAILER_VALUE: &str = "mender";
pub const RUN_TRAILER_KEY: &str = "Remediation-Run";

const DEFAULT_AUTHOR_NAME: &str = "mender";
const DEFAULT_AUTHOR_EMAIL: &str = "mender@users.noreply.github.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCreateOutcome {
    pub branch_name: String,
    pub created_new: bool,
}

/// Who owns an existing branch with the work branch's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOwnership {
    Missing,
    /// Points at the base commit; nothing to lose.
    AtBase,
    /// Every commit since the base carries the ownership trailer.
    Pipeline { commits: usize },
    /// At least one commit was not created by the pipeline.
    Foreign { commit: String },
}

impl BranchOwnership {
    pub fn is_reusable(&self) -> bool {
        !matches!(self, BranchOwnership::Foreign { .. })
    }
}

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

/// True when `message` has a `Remediated-By: mender` trailer line.
pub fn has_ownership_trailer(message: &str) -> bool {
    message.lines().any(|line| {
        line.split_once(':').is_some_and(|(key, value)| {
            key.trim().eq_ignore_ascii_case(OWNERSHIP_TRAILER_KEY)
                && value.trim() == OWNERSHIP_TRAILER_VALUE
        })
    })
}

/// Append the ownership and run trailers to a commit message.
pub fn with_trailers(message: &str, run_id: &str) -> String {
    format!(
        "{}\n\n{}: {}\n{}: {}\n",
        message.trim_end(),
        OWNERSHIP_TRAILER_KEY,
        OWNERSHIP_TRAILER_VALUE,
        RUN_TRAILER_KEY,
        run_id
    )
}

/// Checkout an existing branch
pub fn checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = open_repo_discover(repo_path)?;

    let (object, reference) = repo
        .revparse_ext(name)
        .context(format!("Branch '{}' not found", name))?;

    repo.checkout_tree(&object, None)?;

    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }

    Ok(())
}

/// Resolve the commit id the work branch starts from: the local `base`
/// branch, else `origin/<base>`, else HEAD when HEAD is that branch in a
/// detached CI checkout.
pub fn resolve_base_commit(repo_path: &Path, base: &str) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;

    let branch = repo
        .find_branch(base, BranchType::Local)
        .or_else(|_| repo.find_branch(&format!("origin/{}", base), BranchType::Remote));
    if let Ok(branch) = branch {
        let commit = branch
            .get()
            .peel_to_commit()
            .context(format!("Failed to get commit from base branch '{}'", base))?;
        return Ok(commit.id().to_string());
    }

    let head = repo.head().context("Failed to get HEAD")?;
    let commit = head
        .peel_to_commit()
        .context("Failed to resolve HEAD commit")?;
    tracing::debug!(base, head = %commit.id(), "base branch not found locally; using HEAD");
    Ok(commit.id().to_string())
}

/// Classify an existing local branch named `name` relative to `base_commit`.
pub fn inspect_local_branch(
    repo_path: &Path,
    name: &str,
    base_commit: &str,
) -> Result<BranchOwnership> {
    let repo = open_repo_discover(repo_path)?;
    let base = Oid::from_str(base_commit).context("Invalid base commit id")?;

    let Ok(existing) = repo.find_branch(name, BranchType::Local) else {
        return Ok(BranchOwnership::Missing);
    };
    let tip = existing
        .get()
        .peel_to_commit()
        .context("Failed to get commit from existing branch")?
        .id();
    if tip == base {
        return Ok(BranchOwnership::AtBase);
    }

    let mut walk = repo.revwalk()?;
    walk.push(tip)?;
    walk.hide(base)?;
    let mut commits = 0;
    for oid in walk {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        if !has_ownership_trailer(commit.message().unwrap_or_default()) {
            return Ok(BranchOwnership::Foreign {
                commit: oid.to_string(),
            });
        }
        commits += 1;
    }
    Ok(BranchOwnership::Pipeline { commits })
}

/// Point `name` at `base_commit` and check it out.
///
/// Callers must have confirmed the branch is reusable; any pipeline commits
/// already on it are discarded.
pub fn checkout_work_branch(
    repo_path: &Path,
    name: &str,
    base_commit: &str,
) -> Result<BranchCreateOutcome> {
    let repo = open_repo_discover(repo_path)?;
    let base = repo
        .find_commit(Oid::from_str(base_commit).context("Invalid base commit id")?)
        .context("Base commit not found")?;

    let existed = repo.find_branch(name, BranchType::Local).is_ok();
    let is_head = repo
        .head()
        .ok()
        .and_then(|h| h.shorthand().map(|s| s == name))
        .unwrap_or(false);

    if is_head {
        // Cannot force-move the checked-out branch; reset it instead.
        repo.reset(base.as_object(), git2::ResetType::Hard, None)
            .context(format!("Failed to reset '{}' to base", name))?;
        return Ok(BranchCreateOutcome {
            branch_name: name.to_string(),
            created_new: false,
        });
    }

    repo.branch(name, &base, true)
        .context(format!("Failed to create branch '{}' from base", name))?;

    if let Err(error) = checkout_branch(repo_path, name) {
        if existed {
            return Err(anyhow::anyhow!(
                "Failed to checkout work branch '{}': {}",
                name,
                error
            ));
        }
        // Best-effort cleanup so branch creation is transactional.
        let cleanup_failed = repo
            .find_branch(name, BranchType::Local)
            .and_then(|mut b| b.delete())
            .is_err();
        if cleanup_failed {
            return Err(anyhow::anyhow!(
                "Failed to checkout newly created branch '{}' ({}). Cleanup also failed; you may need to delete the branch manually.",
                name,
                error
            ));
        }
        return Err(anyhow::anyhow!(
            "Failed to checkout newly created branch '{}': {}",
            name,
            error
        ));
    }

    Ok(BranchCreateOutcome {
        branch_name: name.to_string(),
        created_new: !existed,
    })
}

/// Get the current branch name.
pub fn current_branch(repo_path: &Path) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;
    let head = repo.head().context("Failed to get HEAD")?;
    let branch = head
        .shorthand()
        .ok_or_else(|| anyhow::anyhow!("HEAD is not a branch"))?;
    Ok(branch.to_string())
}

/// Deterministic work-branch name: `<prefix>/<run id>-<failure signature>`.
pub fn work_branch_name(prefix: &str, run_id: &str, signature: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let run = sanitize_branch_slug(run_id);
    let sig = sanitize_branch_slug(signature);
    let fallback = format!("{}/{}", prefix, sig);

    if run.is_empty() {
        return fallback;
    }
    let candidate = format!("{}/{}-{}", prefix, run, sig);
    if is_valid_git_ref(&candidate) {
        candidate
    } else {
        fallback
    }
}

fn sanitize_branch_slug(value: &str) -> String {
    let slug: String = value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if slug.chars().count() > 40 {
        slug.chars()
            .take(40)
            .collect::<String>()
            .trim_end_matches('-')
            .to_string()
    } else {
        slug
    }
}

/// Maximum length for git ref names
const MAX_GIT_REF_LENGTH: usize = 255;

pub fn is_valid_git_ref(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_GIT_REF_LENGTH {
        return false;
    }

    // Leading hyphen would be read as a git flag.
    if name.starts_with('-') {
        return false;
    }

    if name.starts_with('.')
        || name.ends_with('.')
        || name.ends_with('/')
        || name.starts_with('/')
        || name.ends_with(".lock")
    {
        return false;
    }

    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return false;
    }

    !name.chars().any(|c| {
        c.is_control()
            || matches!(
                c,
                ' ' | '~'
                    | '^'
                    | ':'
                    | '?'
                    | '*'
                    | '['
                    | '\\'
                    | '\''
                    | '"'
                    | '`'
                    | '$'
                    | '!'
                    | '&'
                    | ';'
                    | '|'
                    | '<'
                    | '>'
            )
    })
}

/// Stage a specific file
pub fn stage_file(repo_path: &Path, file_path: &Path) -> Result<()> {
    let repo = open_repo_discover(repo_path)?;
    let mut index = repo.index()?;

    index
        .add_path(file_path)
        .context(format!("Failed to stage '{}'", file_path.display()))?;
    index.write()?;

    Ok(())
}

/// Reset the index entry for `file_path` to HEAD, dropping it when HEAD has
/// no such file.
pub fn unstage_file(repo_path: &Path, file_path: &Path) -> Result<()> {
    let repo = open_repo_discover(repo_path)?;
    match repo.head().and_then(|head| head.peel(ObjectType::Commit)) {
        Ok(head) => repo
            .reset_default(Some(&head), [file_path])
            .context(format!("Failed to unstage '{}'", file_path.display()))?,
        Err(_) => {
            let mut index = repo.index()?;
            index
                .remove_path(file_path)
                .context(format!("Failed to unstage '{}'", file_path.display()))?;
            index.write()?;
        }
    }
    Ok(())
}

/// Commit staged changes on HEAD and return the new commit id.
pub fn commit(repo_path: &Path, message: &str) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;
    let mut index = repo.index()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = match repo.head().and_then(|head| head.peel_to_commit()) {
        Ok(commit) => Some(commit),
        Err(err)
            if matches!(
                err.code(),
                git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound
            ) =>
        {
            None
        }
        Err(err) => return Err(err.into()),
    };

    // CI checkouts rarely configure an identity.
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| DEFAULT_AUTHOR_NAME.to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| DEFAULT_AUTHOR_EMAIL.to_string());

    let sig = Signature::now(&name, &email)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

    Ok(oid.to_string())
}
