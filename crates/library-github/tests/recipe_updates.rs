//! Recipe update protocol against the in-memory GitHub and lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use library_core::{Classify, ErrorClass, PackageVersions, Settings, TransientKind};
use library_github::fakes::MemoryGitHub;
use library_github::{GitHubError, RecipeRepo};
use library_state::fakes::MemoryAdvisoryLock;
use library_state::{AdvisoryLock, Gate, LockKey};

const TESTED_CBC: &str = "2024.10/tested/conda_build_config.yaml";

struct Fixture {
    github: Arc<MemoryGitHub>,
    lock: Arc<MemoryAdvisoryLock>,
    recipes: RecipeRepo,
}

fn fixture() -> Fixture {
    let github = Arc::new(MemoryGitHub::new());
    let lock = Arc::new(MemoryAdvisoryLock::new());
    let recipes = RecipeRepo::new(github.clone(), lock.clone(), &Settings::default());
    Fixture {
        github,
        lock,
        recipes,
    }
}

fn one(package: &str, version: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(package.to_string(), version.to_string())])
}

#[tokio::test]
async fn build_config_records_snake_case_single_version() {
    let f = fixture();
    f.recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "2024.10.0"))
        .await
        .unwrap();

    let yaml = f.github.file("main", TESTED_CBC).unwrap();
    let doc: BTreeMap<String, Vec<String>> = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(doc["q2_types"], vec!["2024.10.0".to_string()]);

    let commits = f.github.commits();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].message.contains("- q2_types ==2024.10.0"));
    assert_eq!(f.lock.release_count(), 1);
}

#[tokio::test]
async fn build_config_rejects_older_version() {
    let f = fixture();
    f.github.seed_file("main", TESTED_CBC, "q2_types:\n- '1.2'\npython:\n- '3.10'\n");

    let err = f
        .recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::VersionConflict { .. }));
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert_eq!(f.lock.release_count(), 1);
    assert!(!f.lock.is_held(LockKey(42)));

    f.recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "1.3"))
        .await
        .unwrap();
    let doc: BTreeMap<String, Vec<String>> =
        serde_yaml::from_str(&f.github.file("main", TESTED_CBC).unwrap()).unwrap();
    assert_eq!(doc["q2_types"], vec!["1.3".to_string()]);
    assert_eq!(doc["python"], vec!["3.10".to_string()]);
}

#[tokio::test]
async fn build_config_same_version_is_already_recorded() {
    let f = fixture();
    f.github.seed_file("main", TESTED_CBC, "q2_types:\n- '1.2'\n");

    f.recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "1.2"))
        .await
        .unwrap();
    assert!(f.github.commits().is_empty());
    assert_eq!(f.lock.release_count(), 1);
}

#[tokio::test]
async fn build_config_rejects_multi_version_entry() {
    let f = fixture();
    f.github.seed_file("main", TESTED_CBC, "q2_types:\n- '1.0'\n- '1.1'\n");

    let err = f
        .recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "2.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::MalformedRecipe { .. }));
}

#[tokio::test]
async fn busy_lock_fails_retryably_without_git_calls() {
    let f = fixture();
    f.lock.hold(LockKey(42));

    let err = f
        .recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "1.0"))
        .await
        .unwrap_err();

    assert!(matches!(err, GitHubError::LockNotReady));
    assert_eq!(err.class().transient_kind(), Some(TransientKind::LockNotReady));
    assert_eq!(f.github.git_calls(), 0);
    assert_eq!(f.lock.release_count(), 0);
}

#[tokio::test]
async fn passed_gate_is_rejected_before_locking() {
    let f = fixture();
    let err = f
        .recipes
        .update_build_config("main", "2024.10", Gate::Passed, None, &one("q2-types", "1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::InvalidGate(_)));
    assert_eq!(f.lock.acquire_count(), 0);
}

#[tokio::test]
async fn integration_update_writes_branch_and_unions_metapackage() {
    let f = fixture();
    f.github
        .seed_file("main", "2024.10/staged/core/data.yaml", "run:\n- q2-types\n- q2-demux\n");
    let versions = PackageVersions::from([(
        "core".to_string(),
        BTreeMap::from([
            ("q2-types".to_string(), "2024.10.1".to_string()),
            ("q2-cutadapt".to_string(), "2024.10.0".to_string()),
        ]),
    )]);

    f.recipes
        .update_integration("sweep-1", "2024.10", Gate::Staged, &versions)
        .await
        .unwrap();

    assert!(f.github.has_branch("sweep-1"));
    let cbc = f
        .github
        .file("sweep-1", "2024.10/staged/core/conda_build_config.yaml")
        .unwrap();
    assert!(cbc.contains("q2_cutadapt"));

    #[derive(serde::Deserialize)]
    struct Meta {
        run: Vec<String>,
    }
    let meta: Meta =
        serde_yaml::from_str(&f.github.file("sweep-1", "2024.10/staged/core/data.yaml").unwrap())
            .unwrap();
    assert_eq!(meta.run, vec!["q2-cutadapt", "q2-demux", "q2-types"]);

    // main is untouched; one lock scope covers both documents.
    assert!(f.github.file("main", "2024.10/staged/core/conda_build_config.yaml").is_none());
    assert_eq!(f.lock.acquire_count(), 1);
    assert_eq!(f.lock.release_count(), 1);
}

#[tokio::test]
async fn stale_sha_is_a_fatal_conflict() {
    let f = fixture();
    f.github.seed_file("main", TESTED_CBC, "q2_types:\n- '1.0'\n");
    // The branch already diverged from main for this file.
    f.github.seed_file("feature", TESTED_CBC, "q2_types:\n- '1.1'\n");

    let err = f
        .recipes
        .update_build_config("feature", "2024.10", Gate::Tested, None, &one("q2-types", "1.2"))
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::Api { status: 409, .. }));
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert_eq!(f.lock.release_count(), 1);
}

#[tokio::test]
async fn merge_pr_checks_merged_first() {
    let f = fixture();
    f.github.mark_merged(7);
    f.recipes.merge_pr(7).await.unwrap();
    assert_eq!(f.github.calls("merge_pr"), 0);

    f.recipes.merge_pr(8).await.unwrap();
    assert_eq!(f.github.calls("merge_pr"), 1);
    assert!(f.github.is_pr_merged(8));
}

#[tokio::test]
async fn refused_merge_is_fatal() {
    let f = fixture();
    f.github.refuse_merges();
    let err = f.recipes.merge_pr(9).await.unwrap_err();
    assert!(matches!(err, GitHubError::MergeFailed { number: 9, .. }));
    assert_eq!(err.class(), ErrorClass::Internal);
}

#[tokio::test]
async fn open_pr_targets_main() {
    let f = fixture();
    f.recipes.ensure_branch("sweep-2").await.unwrap();
    let url = f.recipes.open_pr("sweep-2", "2024.10 staged", "body").await.unwrap();
    assert_eq!(url, "https://github.com/qiime2/package-integration/pull/1");

    let prs = f.github.pull_requests();
    assert_eq!(prs[0].base, "main");
    assert_eq!(prs[0].head, "sweep-2");
    assert_eq!(prs[0].title, "2024.10 staged");
}

#[tokio::test]
async fn lock_trait_object_is_shared() {
    // Recipe writers in different chains share one lock instance.
    let f = fixture();
    let lock: Arc<dyn AdvisoryLock> = f.lock.clone();
    assert!(lock.try_acquire(LockKey(42)).await.unwrap());
    let err = f
        .recipes
        .update_build_config("main", "2024.10", Gate::Tested, None, &one("q2-types", "1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, GitHubError::LockNotReady));
    lock.release(LockKey(42)).await.unwrap();
}
