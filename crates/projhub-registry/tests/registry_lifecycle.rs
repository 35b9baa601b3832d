//! Registry behavior across process restarts, through the public API only.

use projhub_core::{CallerContext, CreationParams, ProjectError, ProjectFilesystem};
use projhub_registry::templates::TUTORIAL_FILE_PATH;
use projhub_registry::{OpenProjectParams, Registry};
use tempfile::TempDir;

#[tokio::test]
async fn test_project_survives_registry_restart() {
    let temp_dir = TempDir::new().unwrap();
    let ctx = CallerContext::new();

    let (id, member) = {
        let registry = Registry::open(temp_dir.path()).unwrap();
        let id = registry
            .create_project(CreationParams {
                name: "blog".into(),
                template: "web-app-min".into(),
                add_tut_file: true,
            })
            .await
            .unwrap();

        let project = registry
            .open_project(&id, OpenProjectParams::default())
            .await
            .unwrap();
        project
            .live_filesystem()
            .write_file("/posts/first.md", b"# Hello")
            .await
            .unwrap();
        project.upsert_secret(&ctx, "SESSION_KEY", "s3cr3t").await.unwrap();
        let member = project.add_member(&ctx, "ada").await.unwrap();

        registry.close().unwrap();
        (id, member)
    };

    let registry = Registry::open(temp_dir.path()).unwrap();
    assert_eq!(registry.list_project_ids().unwrap(), vec![id.clone()]);

    let project = registry
        .open_project(&id, OpenProjectParams::default())
        .await
        .unwrap();
    assert_eq!(project.creation_params().template, "web-app-min");
    assert_eq!(project.get_member_by_id(&ctx, &member.id).await, Some(member));
    assert_eq!(project.list_secrets(&ctx).await.unwrap(), vec!["SESSION_KEY".to_string()]);

    let fs = project.live_filesystem();
    assert_eq!(fs.read_file("/posts/first.md").await.unwrap(), b"# Hello");
    assert!(fs.exists(TUTORIAL_FILE_PATH).await);
    assert!(fs.exists("/main.ix").await);
}

#[tokio::test]
async fn test_closed_registry_rejects_creation() {
    let temp_dir = TempDir::new().unwrap();
    let registry = Registry::open(temp_dir.path()).unwrap();
    registry.close().unwrap();

    let err = registry
        .create_project(CreationParams {
            name: "late".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ProjectError::Store(_)));
}
