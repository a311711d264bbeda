//! Runtime adapters for Mender (configuration, local git, branch pushing,
//! the hosting-service client, and the repository mutator built on them).

pub mod config;
pub mod git_ops;
pub mod github;
pub mod mutator;
pub mod push;
pub mod util;

pub use config::{Config, ConfigScope, ConfigurationError};
pub use github::{
    GitHubClient, HostingError, HostingService, PullRequestInfo, RemoteBranch, RemoteCommit,
};
pub use mutator::{
    BranchExistsError, BranchHandle, CleanupReport, CommitReference, GitRepositoryMutator,
    MutationError, RemoteUnavailableError, RepositoryMutator, ReviewRequestDraft,
    ReviewRequestReference, SourceFile,
};
pub use push::{BranchPusher, GitCliPusher, PushError};
