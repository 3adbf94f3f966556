//! Library-GitHub: the pipeline's GitHub edge
//!
//! ## Key Components
//!
//! - `client`: the `GitHubApi` seam and its `reqwest` implementation
//! - `artifacts`: fetch a run's artifact and stage its packages into a channel
//! - `recipes`: locked read-merge-write of integration recipes, PR open/merge
//! - `fakes`: in-memory `MemoryGitHub` for tests

pub mod artifacts;
pub mod client;
pub mod error;
pub mod fakes;
pub mod recipes;

pub use artifacts::{ArtifactRequest, ArtifactSync};
pub use client::{
    ArtifactRecord, FileCommit, FileContent, GitHubApi, MergeResult, NewPullRequest, RestGitHub,
};
pub use error::{GitHubError, Result};
pub use recipes::{integration_pr_body, recipe_path, RecipeRepo, BUILD_CONFIG_FILE, METAPACKAGE_FILE};
