//! Channel layout across a full tested → staged → passed promotion.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use library_core::channel::{bootstrap, copy_files, find_package_files};
use library_core::{
    BuildConfig, ChannelError, ChannelIndexer, Classify, CommandIndexer, DistroBuildConfig,
    DistroBuildRequest, ErrorClass, Settings,
};
use library_state::Gate;

fn request(run_id: &str, artifact: &str) -> DistroBuildRequest {
    DistroBuildRequest {
        token: "secret".to_string(),
        version: "2024.10.0.dev1".to_string(),
        run_id: run_id.to_string(),
        distro_name: "amplicon".to_string(),
        epoch_name: "2024.10".to_string(),
        artifact_name: artifact.to_string(),
        pr_number: None,
        package_versions: BTreeMap::from([
            ("q2-types".to_string(), "2024.10.0".to_string()),
            ("q2-feature-table".to_string(), "2024.10.1".to_string()),
        ]),
    }
}

async fn publish(channel: &Path, files: &[&str]) {
    bootstrap(channel).await.unwrap();
    for file in files {
        for arch in ["linux-64", "osx-64"] {
            tokio::fs::write(channel.join(arch).join(file), b"pkg").await.unwrap();
        }
    }
}

#[tokio::test]
async fn test_promotion_moves_files_through_every_gate() {
    let root = tempfile::tempdir().unwrap();
    let settings = Settings::default().with_channel_root(root.path());

    publish(
        &settings.tested_channel("2024.10"),
        &[
            "q2-types-2024.10.0-py310_0.tar.bz2",
            "q2-types-2024.9.0-py310_0.tar.bz2",
            "q2-feature-table-2024.10.1-py310_0.tar.bz2",
        ],
    )
    .await;

    for gate in [Gate::Staged, Gate::Passed] {
        let cfg = DistroBuildConfig::new(&settings, &request("2002", "amplicon-linux"), gate).unwrap();
        let files = find_package_files(cfg.from_channel(), cfg.package_versions())
            .await
            .unwrap();
        assert_eq!(files.len(), 4, "two packages on two architectures");

        let config = BuildConfig::Distro(cfg.clone());
        let copied = copy_files(cfg.from_channel(), config.to_channel(), &files)
            .await
            .unwrap();
        assert_eq!(copied, 4);
        assert_eq!(config.channel_name(), format!("2024.10-amplicon-{gate}"));
    }

    let passed = root.path().join("2024.10/passed/amplicon");
    assert!(passed.join("linux-64/q2-types-2024.10.0-py310_0.tar.bz2").is_file());
    assert!(passed.join("osx-64/q2-feature-table-2024.10.1-py310_0.tar.bz2").is_file());
    assert!(!passed.join("linux-64/q2-types-2024.9.0-py310_0.tar.bz2").exists());
}

#[tokio::test]
async fn test_ambiguous_package_files_are_a_conflict() {
    let root = tempfile::tempdir().unwrap();
    let tested = root.path().join("tested");
    publish(
        &tested,
        &[
            "q2-types-2024.10.0-py310_0.tar.bz2",
            "q2-types-2024.10.0-py311_0.tar.bz2",
        ],
    )
    .await;

    let wanted = BTreeMap::from([("q2-types".to_string(), "2024.10.0".to_string())]);
    let err = find_package_files(&tested, &wanted).await.unwrap_err();
    assert!(matches!(err, ChannelError::FileCountMismatch { found: 2, .. }));
    assert_eq!(err.class(), ErrorClass::Conflict);
}

#[tokio::test]
async fn test_slow_index_command_times_out() {
    let root = tempfile::tempdir().unwrap();
    let indexer = CommandIndexer::new(
        vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
        Duration::from_millis(100),
    );
    let err = indexer
        .reindex(&root.path().join("tested"), "2024.10-tested")
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Timeout { .. }));
    assert!(root.path().join("tested/linux-64").is_dir(), "bootstrapped first");
}
