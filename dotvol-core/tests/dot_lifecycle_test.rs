//! Dot lifecycle integration tests: selection, commits, branches, subdots

mod common;

use common::{cluster, ADMIN_PASSWORD};
use dotvol_core::{ContainerStatus, DebugFlag, ErrorKind, LocalConnector};
use std::sync::Arc;

#[tokio::test]
async fn test_commit_auto_selects_the_only_dot() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let node = &c.node().node;

    let err = node.commit(&admin, None, None, "nothing here").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSelection);
    assert_eq!(err.to_string(), "No current dot is selected");

    node.init(&admin, "apples").await.unwrap();
    node.commit(&admin, None, None, "only one").await.unwrap();

    node.init(&admin, "oranges").await.unwrap();
    let err = node.commit(&admin, None, None, "which one?").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoSelection);

    // Other users' dots do not count towards the caller's selection
    let bob = c.user("bob").await;
    node.init(&bob, "pears").await.unwrap();
    node.commit(&bob, None, None, "bob's only dot").await.unwrap();
}

#[tokio::test]
async fn test_log_order_and_hard_reset() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let n = c.node();

    let record = n.node.init(&admin, "apples").await.unwrap();
    let fs = n.fs(record.id, "master");

    let mut commits = Vec::new();
    for i in 0..3 {
        n.engine
            .write_file(&fs, &format!("__default__/file{}", i), b"data")
            .await
            .unwrap();
        commits.push(n.node.commit(&admin, None, None, &format!("commit {}", i)).await.unwrap());
    }

    let log = n.node.log(&admin, None, None).await.unwrap();
    let messages: Vec<_> = log.iter().map(|c| c.message.as_str()).collect();
    assert_eq!(messages, vec!["commit 2", "commit 1", "commit 0"]);

    n.engine.write_file(&fs, "__default__/scratch", b"junk").await.unwrap();
    let target = n.node.reset(&admin, None, "HEAD^^", true).await.unwrap();
    assert_eq!(target, commits[0].id);

    let files = n.node.list_files(&admin, "apples").await.unwrap();
    assert_eq!(files, vec!["file0".to_string()]);
    let log = n.node.log(&admin, None, None).await.unwrap();
    assert_eq!(log.len(), 1);

    // Later commits stay in the store but are no longer ancestors
    let graph = n.node.registry().graph(&record.id).await.unwrap();
    assert!(graph.contains(&commits[2].id));
    assert!(n
        .node
        .reset(&admin, None, &commits[2].id.to_string(), false)
        .await
        .is_err());
    let err = n.node.reset(&admin, None, "HEAD~5", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_sibling_branches_do_not_leak() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let n = c.node();

    let record = n.node.init(&admin, "apples").await.unwrap();
    n.engine
        .write_file(&n.fs(record.id, "master"), "__default__/base", b"base")
        .await
        .unwrap();
    n.node.commit(&admin, None, None, "base").await.unwrap();

    let branches = ["red", "green", "blue"];
    for branch in branches {
        n.node.checkout(&admin, None, branch, true).await.unwrap();
        n.engine
            .write_file(&n.fs(record.id, branch), &format!("__default__/{}", branch), b"x")
            .await
            .unwrap();
        n.node.commit(&admin, None, None, branch).await.unwrap();
        n.node.checkout(&admin, None, "master", false).await.unwrap();
    }

    for branch in branches {
        let files = n
            .node
            .list_files(&admin, &format!("apples@{}", branch))
            .await
            .unwrap();
        assert_eq!(files, vec!["base".to_string(), branch.to_string()]);
    }
    let master = n.node.list_files(&admin, "apples").await.unwrap();
    assert_eq!(master, vec!["base".to_string()]);

    let mut names = n.node.branches(&admin, None).await.unwrap();
    names.sort();
    assert_eq!(names, vec!["blue", "green", "master", "red"]);

    let err = n.node.checkout(&admin, None, "red", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn test_four_subdots_combined_view() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let n = c.node();

    let subdots = ["frogs", "apples", "zebras", "__root__"];
    let mut fs = None;
    for (i, subdot) in subdots.iter().enumerate() {
        let attachment = n
            .node
            .attach(&admin, &format!("farm.{}", subdot), &format!("worker{}", i))
            .await
            .unwrap();
        // __root__ is the top of the branch filesystem
        let path = match *subdot {
            "__root__" => "data".to_string(),
            dir => format!("{}/data", dir),
        };
        n.engine
            .write_file(&attachment.fs, &path, subdot.as_bytes())
            .await
            .unwrap();
        fs = Some(attachment.fs);
    }
    let fs = fs.unwrap();

    // One commit covers every subdot; all four containers are paused and resumed
    n.node.commit(&admin, Some("farm"), None, "all four").await.unwrap();
    for i in 0..subdots.len() {
        let container = format!("worker{}", i);
        assert_eq!(n.runtime.status(&container).await, Some(ContainerStatus::Running));
        assert_eq!(n.runtime.start_count(&container).await, 1);
    }

    let combined = n.node.list_files(&admin, "farm.__root__").await.unwrap();
    assert_eq!(
        combined,
        vec![
            "apples/data".to_string(),
            "data".to_string(),
            "frogs/data".to_string(),
            "zebras/data".to_string(),
        ]
    );
    assert_eq!(n.node.list_files(&admin, "farm.frogs").await.unwrap(), vec!["data".to_string()]);

    // The committed snapshot holds the same view
    n.engine.write_file(&fs, "scratch", b"x").await.unwrap();
    n.node.reset(&admin, Some("farm"), "HEAD", true).await.unwrap();
    assert_eq!(n.node.list_files(&admin, "farm.__root__").await.unwrap(), combined);
}

#[tokio::test]
async fn test_checkout_restarts_unpinned_containers() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let n = c.node();

    let web = n.node.attach(&admin, "apples", "web").await.unwrap();
    n.node.attach(&admin, "apples.logs", "logger").await.unwrap();
    n.node.attach(&admin, "apples@master.__root__", "backup").await.unwrap();
    n.engine.write_file(&web.fs, "__default__/index", b"v1").await.unwrap();
    n.node.commit(&admin, Some("apples"), None, "v1").await.unwrap();

    n.node.checkout(&admin, Some("apples"), "dev", true).await.unwrap();

    let dev = n.fs(web.dot, "dev");
    for container in ["web", "logger"] {
        assert_eq!(n.runtime.mounted(container).await, Some(dev.clone()));
        assert_eq!(n.runtime.start_count(container).await, 2);
        assert_eq!(n.runtime.status(container).await, Some(ContainerStatus::Running));
    }
    assert_eq!(n.runtime.mounted("backup").await, Some(web.fs.clone()));
    assert_eq!(n.runtime.start_count("backup").await, 1);

    assert_eq!(n.engine.read_file(&dev, "__default__/index").await.unwrap(), Some(b"v1".to_vec()));
}

#[tokio::test]
async fn test_failed_restart_leaves_containers_running() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let n = c.node();

    n.node.attach(&admin, "apples", "web").await.unwrap();
    n.node.attach(&admin, "apples.cache", "cache").await.unwrap();
    n.runtime.set_failing("cache", true).await;

    assert!(n.node.checkout(&admin, Some("apples"), "dev", true).await.is_err());
    assert_eq!(n.runtime.status("web").await, Some(ContainerStatus::Running));
    let details = n.node.show_dot(&admin, Some("apples")).await.unwrap();
    assert_eq!(details.checked_out, "master");
}

#[tokio::test]
async fn test_partial_creation_is_recovered() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let node = &c.node().node;

    node.set_debug_flag(&admin, "PartialFailCreateFilesystem", "true")
        .await
        .unwrap();
    let err = node.init(&admin, "apples").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InjectedFault);
    assert!(node.list_dots(&admin).await.unwrap().is_empty());

    node.flags().set(DebugFlag::PartialFailCreateFilesystem, false);
    let record = node.init(&admin, "apples").await.unwrap();
    node.commit(&admin, Some("apples"), None, "after recovery").await.unwrap();

    let dots = node.list_dots(&admin).await.unwrap();
    assert_eq!(dots.len(), 1);
    assert_eq!(dots[0].id, record.id);
}

#[tokio::test]
async fn test_invalid_names() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let admin = c.admin().await;
    let node = &c.node().node;

    let err = node.attach(&admin, "@", "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert!(err.to_string().starts_with("Invalid dot name"));
    assert!(node.init(&admin, "a/b/c").await.is_err());
}

#[tokio::test]
async fn test_api_key_reset() {
    let connector = Arc::new(LocalConnector::new());
    let c = cluster("cluster-a", 1, &connector).await;
    let node = &c.node().node;

    let by_password = node.authenticate("admin", ADMIN_PASSWORD).await.unwrap();
    let old_key = node.get_api_key(&by_password).await.unwrap();
    let by_key = node.authenticate("admin", &old_key).await.unwrap();

    // The key itself cannot be used to rotate the key
    let err = node.reset_api_key(&by_key).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    let new_key = node.reset_api_key(&by_password).await.unwrap();
    assert_ne!(new_key, old_key);
    assert!(node.authenticate("admin", &old_key).await.is_err());
    let session = node.authenticate("admin", &new_key).await.unwrap();
    assert_eq!(node.current_user(&session).await.unwrap().name, "admin");
    assert_eq!(node.get_api_key(&session).await.unwrap(), new_key);
}
