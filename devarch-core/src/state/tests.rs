use crate::apply::{ApplyExecutor, ApplyOptions};
use crate::config::EngineConfig;
use crate::error::DevarchError;
use crate::plan::{PlanEngine, PlanOptions};
use crate::repository::Repository;
use crate::state::StateManager;
use crate::types::{
    EnvVar, Lifecycle, Override, OverrideKind, OverrideSet, PortMapping, ServiceTemplate,
};
use crate::wiring::ExplicitWire;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn web_template() -> ServiceTemplate {
    ServiceTemplate::builder("tpl-web", "web")
        .image("nginx:1.27")
        .port(8080, 80)
        .env("MODE", "prod")
        .export("http", "http", Some(80))
        .import("db", "postgres")
        .build()
}

fn db_template() -> ServiceTemplate {
    ServiceTemplate::builder("tpl-db", "postgres")
        .image("postgres:16")
        .export("sql", "postgres", Some(5432))
        .build()
}

/// Manager with both templates and a stack `shop` holding `web-a` and `db-a`.
async fn seeded() -> (StateManager, String) {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_template(&web_template()).await.unwrap();
    manager.insert_template(&db_template()).await.unwrap();

    let stack = manager.create_stack("shop", "storefront").await.unwrap();
    manager.create_instance(&stack.id, "web-a", "tpl-web", "").await.unwrap();
    manager.create_instance(&stack.id, "db-a", "tpl-db", "").await.unwrap();
    (manager, stack.id)
}

async fn apply_all(manager: &StateManager, stack_id: &str) {
    let repo: Arc<dyn Repository> = Arc::new(manager.clone());
    let plan = PlanEngine::new(repo.clone(), PlanOptions::default()).generate_plan(stack_id).await.unwrap();
    ApplyExecutor::new(repo, EngineConfig::default())
        .apply(&plan, ApplyOptions { confirm_warnings: true, lock_timeout: None })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_state_manager_init() {
    let manager = StateManager::new_in_memory().await.unwrap();
    // Running migrations again is a no-op
    crate::state::migrations::run(manager.pool()).await.unwrap();
    assert!(manager.list_stacks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("devarch.db");

    let stack_id = {
        let manager = StateManager::new(&path).await.unwrap();
        manager.insert_template(&db_template()).await.unwrap();
        manager.create_stack("shop", "").await.unwrap().id
    };

    let reopened = StateManager::new(&path).await.unwrap();
    assert_eq!(reopened.get_stack(&stack_id).await.unwrap().name, "shop");
    assert_eq!(reopened.get_template("tpl-db").await.unwrap().revision, 1);
}

#[tokio::test]
async fn test_from_config_uses_database_path_and_lock_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        database_path: dir.path().join("state").join("devarch.db").to_string_lossy().to_string(),
        lock_timeout_secs: 0,
        ..Default::default()
    };

    let manager = StateManager::from_config(&config).await.unwrap();
    manager.insert_template(&db_template()).await.unwrap();
    let stack = manager.create_stack("shop", "").await.unwrap();
    manager.create_instance(&stack.id, "db-a", "tpl-db", "").await.unwrap();
    assert!(dir.path().join("state").join("devarch.db").exists());

    let _held = manager.acquire_stack_lock(&stack.id, Duration::from_secs(1)).await.unwrap();
    let err = manager
        .set_override(&stack.id, "db-a", OverrideSet::Ports(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DevarchError::LockTimeout { .. }));
}

#[tokio::test]
async fn test_template_revisions() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let stored = manager.insert_template(&db_template()).await.unwrap();
    assert_eq!(stored.revision, 1);

    let mut newer = db_template();
    newer.image = "postgres:17".to_string();
    let updated = manager.update_template(&newer).await.unwrap();
    assert_eq!(updated.revision, 2);

    let loaded = manager.get_template("tpl-db").await.unwrap();
    assert_eq!(loaded.image, "postgres:17");
    assert_eq!(loaded.revision, 2);

    let err = manager.insert_template(&db_template()).await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));

    let mut missing = db_template();
    missing.id = "tpl-none".to_string();
    let err = manager.update_template(&missing).await.unwrap_err();
    assert!(matches!(err, DevarchError::TemplateNotFound { .. }));
}

#[tokio::test]
async fn test_stack_names_unique_among_active() {
    let manager = StateManager::new_in_memory().await.unwrap();
    let first = manager.create_stack("shop", "").await.unwrap();

    let err = manager.create_stack("shop", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));

    let err = manager.create_stack("Shop Front", "").await.unwrap_err();
    assert!(err.to_string().contains("try: shop-front"), "{err}");

    manager.soft_delete_stack(&first.id).await.unwrap();
    let second = manager.create_stack("shop", "").await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(manager.get_stack_by_name("shop").await.unwrap().id, second.id);

    // The original cannot come back while its name is taken
    let err = manager.restore_stack(&first.id).await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));
}

#[tokio::test]
async fn test_soft_delete_and_restore_stack() {
    let (manager, stack_id) = seeded().await;
    manager.soft_delete_instance(&stack_id, "web-a").await.unwrap();

    let deleted = manager.soft_delete_stack(&stack_id).await.unwrap();
    assert!(!deleted.lifecycle.is_active());
    assert!(manager.list_stacks().await.unwrap().is_empty());
    assert_eq!(manager.list_trash().await.unwrap().len(), 1);

    let err = manager.create_instance(&stack_id, "cache", "tpl-db", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::StackDeleted { .. }));

    let restored = manager.restore_stack(&stack_id).await.unwrap();
    assert!(restored.lifecycle.is_active());
    assert!(restored.revision > deleted.revision);

    // Only the instances deleted together with the stack come back
    let names: Vec<_> =
        manager.list_instances(&stack_id).await.unwrap().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["db-a"]);
}

#[tokio::test]
async fn test_purge_requires_applied_teardown() {
    let (manager, stack_id) = seeded().await;

    let err = manager.purge_stack(&stack_id).await.unwrap_err();
    assert!(err.to_string().contains("must be deleted"));

    apply_all(&manager, &stack_id).await;
    manager.soft_delete_stack(&stack_id).await.unwrap();
    let err = manager.purge_stack(&stack_id).await.unwrap_err();
    assert!(err.to_string().contains("applied instance"), "{err}");

    // Applying the tombstoned stack tears everything down
    apply_all(&manager, &stack_id).await;
    manager.purge_stack(&stack_id).await.unwrap();

    let err = manager.get_stack(&stack_id).await.unwrap_err();
    assert!(matches!(err, DevarchError::StackNotFound { .. }));
    assert!(manager.load_instances(&stack_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_name_held_until_deleted_stack_is_torn_down() {
    let (manager, stack_id) = seeded().await;
    apply_all(&manager, &stack_id).await;
    manager.soft_delete_stack(&stack_id).await.unwrap();

    // devarch-shop-db-a is still running under the tombstoned stack
    let err = manager.create_stack("shop", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));
    assert!(err.to_string().contains("2 applied instance(s)"), "{err}");

    let other = manager.create_stack("outlet", "").await.unwrap();
    let err = manager.clone_stack(&other.id, "shop").await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));
    let err = manager.rename_stack(&other.id, "shop").await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));

    // Restoring the owner itself is fine
    manager.restore_stack(&stack_id).await.unwrap();
    manager.soft_delete_stack(&stack_id).await.unwrap();

    apply_all(&manager, &stack_id).await;
    let fresh = manager.create_stack("shop", "").await.unwrap();
    assert_ne!(fresh.id, stack_id);
}

#[tokio::test]
async fn test_restore_blocked_by_pending_teardown_of_same_name() {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_template(&db_template()).await.unwrap();

    let idle = manager.create_stack("shop", "").await.unwrap();
    manager.soft_delete_stack(&idle.id).await.unwrap();

    let live = manager.create_stack("shop", "").await.unwrap();
    manager.create_instance(&live.id, "db-a", "tpl-db", "").await.unwrap();
    apply_all(&manager, &live.id).await;
    manager.soft_delete_stack(&live.id).await.unwrap();

    let err = manager.restore_stack(&idle.id).await.unwrap_err();
    assert!(err.to_string().contains("apply its deletion first"), "{err}");

    apply_all(&manager, &live.id).await;
    assert!(manager.restore_stack(&idle.id).await.unwrap().lifecycle.is_active());
}

#[tokio::test]
async fn test_clone_stack_copies_definition_not_snapshots() {
    let (manager, stack_id) = seeded().await;
    manager
        .set_override(&stack_id, "web-a", OverrideSet::Ports(vec![PortMapping::tcp(9090, 80)]))
        .await
        .unwrap();
    manager
        .add_wire(
            &stack_id,
            &ExplicitWire {
                consumer: "web-a".into(),
                import_name: "db".into(),
                provider: "db-a".into(),
                export_name: None,
            },
        )
        .await
        .unwrap();
    apply_all(&manager, &stack_id).await;

    let clone = manager.clone_stack(&stack_id, "shop-staging").await.unwrap();
    let state = manager.load_stack_state(&clone.id).await.unwrap();

    assert_eq!(state.instances.len(), 2);
    assert!(state.instances.iter().all(|i| i.applied.is_none()));
    let web = state.instances.iter().find(|i| i.name == "web-a").unwrap();
    assert!(web.overrides.is_present(OverrideKind::Ports));
    assert_eq!(state.wires.len(), 1);
    assert!(state.applied_edges.is_empty());

    // Source stack is untouched
    let source = manager.load_stack_state(&stack_id).await.unwrap();
    assert!(source.instances.iter().all(|i| i.applied.is_some()));
}

#[tokio::test]
async fn test_rename_stack_tombstones_original() {
    let (manager, stack_id) = seeded().await;

    let renamed = manager.rename_stack(&stack_id, "market").await.unwrap();
    assert_eq!(renamed.name, "market");
    assert_ne!(renamed.id, stack_id);

    let original = manager.get_stack(&stack_id).await.unwrap();
    assert!(matches!(original.lifecycle, Lifecycle::Deleted { .. }));
    assert_eq!(manager.list_instances(&renamed.id).await.unwrap().len(), 2);

    let err = manager.rename_stack(&stack_id, "again").await.unwrap_err();
    assert!(matches!(err, DevarchError::StackDeleted { .. }));
}

#[tokio::test]
async fn test_create_instance_validation() {
    let (manager, stack_id) = seeded().await;

    let err = manager.create_instance(&stack_id, "web-a", "tpl-web", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));

    let err = manager.create_instance(&stack_id, "cache", "tpl-redis", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::TemplateNotFound { .. }));

    let err = manager.create_instance(&stack_id, "Web_B", "tpl-web", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::InvalidName { .. }));

    let err = manager.create_instance("no-such-stack", "web-b", "tpl-web", "").await.unwrap_err();
    assert!(matches!(err, DevarchError::StackNotFound { .. }));
}

#[tokio::test]
async fn test_container_name_length_is_checked() {
    let manager = StateManager::new_in_memory().await.unwrap();
    manager.insert_template(&db_template()).await.unwrap();
    let stack = manager.create_stack(&"s".repeat(63), "").await.unwrap();

    let err = manager.create_instance(&stack.id, &"i".repeat(63), "tpl-db", "").await.unwrap_err();
    assert!(err.to_string().contains("container name exceeds"), "{err}");
}

#[tokio::test]
async fn test_duplicate_instance() {
    let (manager, stack_id) = seeded().await;
    manager
        .set_override(
            &stack_id,
            "db-a",
            OverrideSet::Labels(BTreeMap::from([("tier".to_string(), "data".to_string())])),
        )
        .await
        .unwrap();

    let copy = manager.duplicate_instance(&stack_id, "db-a", None).await.unwrap();
    assert_eq!(copy.name, "db-a-copy");
    assert_eq!(copy.template_id, "tpl-db");
    assert!(copy.overrides.is_present(OverrideKind::Labels));

    let named = manager.duplicate_instance(&stack_id, "db-a", Some("db-b")).await.unwrap();
    assert_eq!(named.name, "db-b");

    let err = manager.duplicate_instance(&stack_id, "db-a", Some("db-b")).await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));
}

#[tokio::test]
async fn test_instance_soft_delete_and_restore() {
    let (manager, stack_id) = seeded().await;
    let web = manager.get_instance(&stack_id, "web-a").await.unwrap();

    manager.soft_delete_instance(&stack_id, "web-a").await.unwrap();
    let err = manager.get_instance(&stack_id, "web-a").await.unwrap_err();
    assert!(matches!(err, DevarchError::InstanceNotFound { .. }));

    // The name is free again while the old row sits in the trash
    let replacement = manager.create_instance(&stack_id, "web-a", "tpl-web", "").await.unwrap();
    let err = manager.restore_instance(&stack_id, &web.uid).await.unwrap_err();
    assert!(matches!(err, DevarchError::NameConflict { .. }));

    manager.soft_delete_instance(&stack_id, "web-a").await.unwrap();
    let restored = manager.restore_instance(&stack_id, &web.uid).await.unwrap();
    assert!(restored.is_active());
    assert_eq!(manager.get_instance(&stack_id, "web-a").await.unwrap().uid, web.uid);
    assert_ne!(replacement.uid, web.uid);
}

#[tokio::test]
async fn test_set_and_clear_override() {
    let (manager, stack_id) = seeded().await;
    let before = manager.get_instance(&stack_id, "web-a").await.unwrap();

    let env = BTreeMap::from([("MODE".to_string(), EnvVar::plain("dev"))]);
    let updated = manager.set_override(&stack_id, "web-a", OverrideSet::EnvVars(env.clone())).await.unwrap();
    assert_eq!(updated.revision, before.revision + 1);

    let loaded = manager.get_instance(&stack_id, "web-a").await.unwrap();
    assert_eq!(loaded.revision, updated.revision);
    assert_eq!(loaded.overrides.env_vars, Override::Present(env));
    assert!(matches!(
        manager.load_override(&loaded.uid, OverrideKind::EnvVars).await.unwrap(),
        Override::Present(OverrideSet::EnvVars(_))
    ));

    manager.clear_override(&stack_id, "web-a", OverrideKind::EnvVars).await.unwrap();
    let cleared = manager.get_instance(&stack_id, "web-a").await.unwrap();
    assert_eq!(cleared.overrides.env_vars, Override::Absent);
    assert_eq!(
        manager.load_override(&cleared.uid, OverrideKind::EnvVars).await.unwrap(),
        Override::Absent
    );
}

#[tokio::test]
async fn test_present_empty_override_survives_storage() {
    let (manager, stack_id) = seeded().await;
    manager.set_override(&stack_id, "web-a", OverrideSet::Ports(vec![])).await.unwrap();

    let loaded = manager.get_instance(&stack_id, "web-a").await.unwrap();
    assert_eq!(loaded.overrides.ports, Override::Present(vec![]));
}

#[tokio::test]
async fn test_reserved_override_keys_rejected() {
    let (manager, stack_id) = seeded().await;

    let env = BTreeMap::from([("DEVARCH_STACK_ID".to_string(), EnvVar::plain("spoofed"))]);
    let err = manager.set_override(&stack_id, "web-a", OverrideSet::EnvVars(env)).await.unwrap_err();
    assert!(matches!(err, DevarchError::ReservedKey { ref prefix, .. } if prefix == "DEVARCH_"));

    let labels = BTreeMap::from([("devarch.managed_by".to_string(), "me".to_string())]);
    let err = manager.set_override(&stack_id, "web-a", OverrideSet::Labels(labels)).await.unwrap_err();
    assert!(matches!(err, DevarchError::ReservedKey { ref prefix, .. } if prefix == "devarch."));

    let err = manager.clear_override(&stack_id, "web-a", OverrideKind::Dependencies).await.unwrap_err();
    assert!(matches!(err, DevarchError::Validation { .. }));

    // Nothing was written
    let web = manager.get_instance(&stack_id, "web-a").await.unwrap();
    assert_eq!(web.revision, 1);
}

#[tokio::test]
async fn test_override_write_waits_for_stack_lock() {
    let (manager, stack_id) = seeded().await;
    let manager = manager.with_lock_timeout(Duration::from_millis(50));

    let held = manager.acquire_stack_lock(&stack_id, Duration::from_secs(1)).await.unwrap();
    assert!(manager.is_stack_locked(&stack_id).await);

    let err = manager
        .set_override(&stack_id, "web-a", OverrideSet::Ports(vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DevarchError::LockTimeout { .. }));

    drop(held);
    manager.set_override(&stack_id, "web-a", OverrideSet::Ports(vec![])).await.unwrap();
}

#[tokio::test]
async fn test_wires() {
    let (manager, stack_id) = seeded().await;
    let wire = ExplicitWire {
        consumer: "web-a".into(),
        import_name: "db".into(),
        provider: "db-a".into(),
        export_name: Some("sql".into()),
    };
    let revision = manager.get_stack(&stack_id).await.unwrap().revision;

    manager.add_wire(&stack_id, &wire).await.unwrap();
    assert_eq!(manager.list_wires(&stack_id).await.unwrap(), vec![wire.clone()]);
    assert!(manager.get_stack(&stack_id).await.unwrap().revision > revision);

    let err = manager.add_wire(&stack_id, &wire).await.unwrap_err();
    assert!(err.to_string().contains("already wired"), "{err}");

    let ghost = ExplicitWire { provider: "db-z".into(), ..wire.clone() };
    let err = manager.add_wire(&stack_id, &ghost).await.unwrap_err();
    assert!(matches!(err, DevarchError::InstanceNotFound { .. }));

    let selfish = ExplicitWire { provider: "web-a".into(), ..wire.clone() };
    let err = manager.add_wire(&stack_id, &selfish).await.unwrap_err();
    assert!(matches!(err, DevarchError::Validation { .. }));

    manager.remove_wire(&stack_id, "web-a", "db").await.unwrap();
    assert!(manager.list_wires(&stack_id).await.unwrap().is_empty());
    assert!(manager.remove_wire(&stack_id, "web-a", "db").await.is_err());
}

#[tokio::test]
async fn test_atomic_unit_rollback_and_commit() {
    let (manager, stack_id) = seeded().await;
    let web = manager.get_instance(&stack_id, "web-a").await.unwrap();

    let lock = manager.acquire_stack_lock(&stack_id, Duration::from_secs(1)).await.unwrap();
    let mut unit = manager.begin_atomic(lock).await.unwrap();
    assert_eq!(unit.stack_id(), stack_id);
    unit.soft_delete(&web.uid, chrono::Utc::now()).await.unwrap();
    let inside = unit.load_stack_state().await.unwrap();
    assert!(!inside.instance(&web.uid).unwrap().is_active());
    unit.rollback().await.unwrap();

    assert!(!manager.is_stack_locked(&stack_id).await);
    assert!(manager.get_instance(&stack_id, "web-a").await.unwrap().is_active());

    let lock = manager.acquire_stack_lock(&stack_id, Duration::from_secs(1)).await.unwrap();
    let mut unit = manager.begin_atomic(lock).await.unwrap();
    unit.soft_delete(&web.uid, chrono::Utc::now()).await.unwrap();
    unit.commit().await.unwrap();

    assert!(manager.get_instance(&stack_id, "web-a").await.is_err());
    let locks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stack_locks")
        .fetch_one(manager.pool())
        .await
        .unwrap();
    assert_eq!(locks, 0);
}

#[tokio::test]
async fn test_dropped_unit_discards_writes() {
    let (manager, stack_id) = seeded().await;
    let web = manager.get_instance(&stack_id, "web-a").await.unwrap();

    {
        let lock = manager.acquire_stack_lock(&stack_id, Duration::from_secs(1)).await.unwrap();
        let mut unit = manager.begin_atomic(lock).await.unwrap();
        unit.soft_delete(&web.uid, chrono::Utc::now()).await.unwrap();
    }

    assert!(manager.get_instance(&stack_id, "web-a").await.unwrap().is_active());
    assert!(!manager.is_stack_locked(&stack_id).await);
}

#[tokio::test]
async fn test_unit_rejects_foreign_instance() {
    let (manager, stack_id) = seeded().await;
    let other = manager.create_stack("other", "").await.unwrap();
    let foreign = manager.create_instance(&other.id, "db-x", "tpl-db", "").await.unwrap();

    let lock = manager.acquire_stack_lock(&stack_id, Duration::from_secs(1)).await.unwrap();
    let mut unit = manager.begin_atomic(lock).await.unwrap();
    assert!(unit.save_instance(&foreign).await.is_err());
    let err = unit.soft_delete(&foreign.uid, chrono::Utc::now()).await.unwrap_err();
    assert!(matches!(err, DevarchError::InstanceNotFound { .. }));
    unit.rollback().await.unwrap();
}
