//! Tests for the reconciler module
//!
//! These tests drive the state machine against the in-memory store and
//! verify:
//! - Operation selection (deletion wins, annotations select migrate/restore)
//! - Finalizer ordering around actuator calls
//! - Annotation clearing and status bookkeeping
//! - Error handling (retriable, terminal, conflicts)

#[cfg(test)]
mod tests {
    use super::super::actuator::{ActuatorError, Outcome};
    use super::super::finalizers::{finalizer_name, FINALIZER_PREFIX};
    use super::super::store::ObjectKey;
    use super::super::reconciler::*;
    use crate::crd::{
        Cluster, ClusterSpec, Extension, ExtensionSpec, LastOperationState, LastOperationType,
        ANNOTATION_FORCE_DELETION, ANNOTATION_OPERATION, OPERATION_MIGRATE, OPERATION_RECONCILE,
        OPERATION_RESTORE,
    };
    use crate::error::Error;
    use crate::testing::{MemoryStore, ScriptedActuator};
    use kube::api::ObjectMeta;
    use kube::runtime::controller::Action;
    use kube::ResourceExt;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    const TYPE: &str = "foo";

    type TestReconciler = Reconciler<Arc<ScriptedActuator>, MemoryStore>;

    fn key() -> ObjectKey {
        ObjectKey::new("ns1", TYPE)
    }

    fn finalizer() -> String {
        finalizer_name(FINALIZER_PREFIX, TYPE)
    }

    /// Helper to create a test Extension with optional annotations and finalizers
    fn create_test_extension(annotations: &[(&str, &str)], finalizers: &[String]) -> Extension {
        Extension {
            metadata: ObjectMeta {
                name: Some(TYPE.to_string()),
                namespace: Some("ns1".to_string()),
                generation: Some(1),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                finalizers: Some(finalizers.to_vec()),
                ..Default::default()
            },
            spec: ExtensionSpec {
                type_: TYPE.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn setup(ignore_operation_annotation: bool) -> (Arc<MemoryStore>, Arc<ScriptedActuator>, TestReconciler) {
        let store = Arc::new(MemoryStore::default());
        store.put_cluster(Cluster::new("ns1", ClusterSpec::default()));
        let actuator = Arc::new(ScriptedActuator::default());
        let reconciler = Reconciler::new(
            "foo-extension-controller",
            Arc::clone(&actuator),
            Arc::clone(&store),
            finalizer(),
            ignore_operation_annotation,
        );
        (store, actuator, reconciler)
    }

    /// Store an Extension carrying our finalizer and mark it for deletion
    fn put_deleting(store: &MemoryStore, annotations: &[(&str, &str)]) -> Extension {
        store.put_extension(create_test_extension(annotations, &[finalizer()]));
        store.request_deletion(&key()).expect("extension exists")
    }

    fn last_operation(store: &MemoryStore) -> (LastOperationType, LastOperationState) {
        let ext = store.extension(&key()).expect("extension exists");
        let op = ext.last_operation().expect("last operation recorded");
        (op.type_, op.state)
    }

    // ========================================================================
    // Operation selection
    // ========================================================================

    #[test]
    fn test_operation_from_annotation() {
        let cases = [
            (None, Operation::Reconcile),
            (Some(OPERATION_RECONCILE), Operation::Reconcile),
            (Some(OPERATION_MIGRATE), Operation::Migrate),
            (Some(OPERATION_RESTORE), Operation::Restore),
            (Some(""), Operation::Reconcile),
        ];
        for (annotation, expected) in cases {
            let annotations: Vec<(&str, &str)> = annotation
                .map(|a| vec![(ANNOTATION_OPERATION, a)])
                .unwrap_or_default();
            let ext = create_test_extension(&annotations, &[]);
            assert_eq!(Operation::for_extension(&ext, None), expected);
        }
    }

    #[test]
    fn test_deletion_always_selects_delete() {
        for annotation in [OPERATION_RECONCILE, OPERATION_MIGRATE, OPERATION_RESTORE] {
            let mut ext = create_test_extension(&[(ANNOTATION_OPERATION, annotation)], &[]);
            ext.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
            );
            let op = Operation::for_extension(&ext, None);
            assert_eq!(op, Operation::Delete);
            assert!(op.is_deletion());
            assert_eq!(op.last_operation_type(), LastOperationType::Delete);
        }
    }

    #[test]
    fn test_force_deletion_from_extension_or_cluster() {
        let mut ext = create_test_extension(&[(ANNOTATION_FORCE_DELETION, "true")], &[]);
        ext.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()),
        );
        assert_eq!(Operation::for_extension(&ext, None), Operation::ForceDelete);

        ext.annotations_mut().remove(ANNOTATION_FORCE_DELETION);
        let mut spec = ClusterSpec::default();
        spec.shoot
            .metadata
            .annotations
            .insert(ANNOTATION_FORCE_DELETION.to_string(), "true".to_string());
        let cluster = Cluster::new("ns1", spec);
        assert_eq!(
            Operation::for_extension(&ext, Some(&cluster)),
            Operation::ForceDelete
        );
        assert_eq!(
            Operation::for_extension(&ext, Some(&Cluster::new("ns1", ClusterSpec::default()))),
            Operation::Delete
        );
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    #[tokio::test]
    async fn test_gated_reconcile_clears_annotation_and_records_success() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_RECONCILE)],
            &[],
        ));

        let action = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(actuator.operations(), vec![Operation::Reconcile]);

        let ext = store.extension(&key()).unwrap();
        assert!(!ext.annotations().contains_key(ANNOTATION_OPERATION));
        assert!(ext.has_finalizer(&finalizer()));
        assert_eq!(
            last_operation(&store),
            (LastOperationType::Reconcile, LastOperationState::Succeeded)
        );
        let status = ext.status.unwrap();
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_finalizer_present_when_actuator_runs() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_RECONCILE)],
            &[],
        ));

        reconciler.reconcile(&key()).await.unwrap();

        let calls = actuator.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].extension.has_finalizer(&finalizer()));
        let (type_, state) = {
            let op = calls[0].extension.last_operation().unwrap();
            (op.type_, op.state)
        };
        assert_eq!(type_, LastOperationType::Reconcile);
        assert_eq!(state, LastOperationState::Processing);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, actuator, reconciler) = setup(true);
        store.put_extension(create_test_extension(&[], &[]));

        reconciler.reconcile(&key()).await.unwrap();
        let first = store.extension(&key()).unwrap();
        reconciler.reconcile(&key()).await.unwrap();
        let second = store.extension(&key()).unwrap();

        assert_eq!(actuator.operations().len(), 2);
        assert_eq!(second.finalizers(), &[finalizer()]);
        assert!(first.status.unwrap().same_as(second.status.as_ref().unwrap()));
    }

    #[tokio::test]
    async fn test_level_triggered_reconcile_keeps_annotation() {
        let (store, _actuator, reconciler) = setup(true);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_RECONCILE)],
            &[],
        ));

        reconciler.reconcile(&key()).await.unwrap();

        let ext = store.extension(&key()).unwrap();
        assert_eq!(ext.operation_annotation(), Some(OPERATION_RECONCILE));
    }

    #[tokio::test]
    async fn test_actuator_requeue_is_returned() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(&[], &[]));
        actuator.respond(
            Operation::Reconcile,
            Ok(Outcome::requeue_after(Duration::from_secs(30))),
        );

        let action = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_missing_extension_is_noop() {
        let (_store, actuator, reconciler) = setup(false);

        let action = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(actuator.calls().is_empty());
    }

    // ========================================================================
    // Errors
    // ========================================================================

    #[tokio::test]
    async fn test_retriable_failure_keeps_annotation_and_records_error() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_RECONCILE)],
            &[],
        ));
        actuator.respond(
            Operation::Reconcile,
            Err(ActuatorError::retriable("dns zone not ready")),
        );

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Actuator(_)));
        assert!(err.is_retriable());

        let ext = store.extension(&key()).unwrap();
        assert_eq!(ext.operation_annotation(), Some(OPERATION_RECONCILE));
        assert_eq!(
            last_operation(&store),
            (LastOperationType::Reconcile, LastOperationState::Error)
        );
        let last_error = ext.status.unwrap().last_error.unwrap();
        assert!(last_error.retriable);
        assert!(last_error.description.contains("dns zone not ready"));
    }

    #[tokio::test]
    async fn test_repeated_failure_does_not_rewrite_status() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(&[], &[]));
        for _ in 0..2 {
            actuator.respond(Operation::Reconcile, Err(ActuatorError::retriable("boom")));
        }

        reconciler.reconcile(&key()).await.unwrap_err();
        let writes = store.write_count();
        reconciler.reconcile(&key()).await.unwrap_err();

        assert_eq!(store.write_count(), writes);
        assert_eq!(actuator.operations().len(), 2);
    }

    #[tokio::test]
    async fn test_terminal_failure_is_recorded_as_failed() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(&[], &[]));
        actuator.respond(
            Operation::Reconcile,
            Err(ActuatorError::terminal("invalid provider config")),
        );

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(!err.is_retriable());
        assert_eq!(
            last_operation(&store),
            (LastOperationType::Reconcile, LastOperationState::Failed)
        );
        let ext = store.extension(&key()).unwrap();
        assert!(!ext.status.unwrap().last_error.unwrap().retriable);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_and_next_attempt_succeeds() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(&[], &[]));
        store.inject_conflicts(1);

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(actuator.calls().is_empty());

        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(actuator.operations(), vec![Operation::Reconcile]);
    }

    // ========================================================================
    // Migrate / Restore
    // ========================================================================

    #[tokio::test]
    async fn test_migrate_and_restore_clear_annotation() {
        for (annotation, operation, type_) in [
            (OPERATION_MIGRATE, Operation::Migrate, LastOperationType::Migrate),
            (OPERATION_RESTORE, Operation::Restore, LastOperationType::Restore),
        ] {
            // level-triggered mode still clears migrate/restore
            let (store, actuator, reconciler) = setup(true);
            store.put_extension(create_test_extension(&[(ANNOTATION_OPERATION, annotation)], &[]));

            reconciler.reconcile(&key()).await.unwrap();

            assert_eq!(actuator.operations(), vec![operation]);
            let ext = store.extension(&key()).unwrap();
            assert!(ext.operation_annotation().is_none());
            assert!(ext.has_finalizer(&finalizer()));
            assert_eq!(last_operation(&store), (type_, LastOperationState::Succeeded));
        }
    }

    #[tokio::test]
    async fn test_failed_migrate_keeps_annotation() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_MIGRATE)],
            &[],
        ));
        actuator.respond(Operation::Migrate, Err(ActuatorError::retriable("busy")));

        reconciler.reconcile(&key()).await.unwrap_err();
        let ext = store.extension(&key()).unwrap();
        assert_eq!(ext.operation_annotation(), Some(OPERATION_MIGRATE));
    }

    // ========================================================================
    // Delete
    // ========================================================================

    #[tokio::test]
    async fn test_successful_delete_removes_finalizer() {
        let (store, actuator, reconciler) = setup(false);
        put_deleting(&store, &[(ANNOTATION_OPERATION, OPERATION_MIGRATE)]);

        let action = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(actuator.operations(), vec![Operation::Delete]);
        // last finalizer gone, object released
        assert!(store.extension(&key()).is_none());
    }

    #[tokio::test]
    async fn test_failing_delete_keeps_finalizer() {
        let (store, actuator, reconciler) = setup(false);
        put_deleting(&store, &[]);
        actuator.respond(
            Operation::Delete,
            Err(ActuatorError::retriable("load balancer still attached")),
        );

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(err.is_retriable());

        let ext = store.extension(&key()).expect("deletion blocked by finalizer");
        assert!(ext.has_finalizer(&finalizer()));
        assert_eq!(
            last_operation(&store),
            (LastOperationType::Delete, LastOperationState::Error)
        );
        assert!(ext.status.unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_delete_in_progress_requeues_with_finalizer() {
        let (store, actuator, reconciler) = setup(false);
        put_deleting(&store, &[]);
        actuator.respond(
            Operation::Delete,
            Ok(Outcome::requeue_after(Duration::from_secs(5))),
        );

        let action = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert!(store.extension(&key()).unwrap().has_finalizer(&finalizer()));

        // next attempt completes
        reconciler.reconcile(&key()).await.unwrap();
        assert!(store.extension(&key()).is_none());
    }

    #[tokio::test]
    async fn test_delete_without_own_finalizer_is_noop() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(&[], &["other.io/keep".to_string()]));
        store.request_deletion(&key()).unwrap();

        reconciler.reconcile(&key()).await.unwrap();
        assert!(actuator.calls().is_empty());
        assert_eq!(
            store.extension(&key()).unwrap().finalizers(),
            &["other.io/keep".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_after_migration_skips_actuator() {
        let (store, actuator, reconciler) = setup(false);
        store.put_extension(create_test_extension(
            &[(ANNOTATION_OPERATION, OPERATION_MIGRATE)],
            &[],
        ));
        reconciler.reconcile(&key()).await.unwrap();
        store.request_deletion(&key()).unwrap();

        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(actuator.operations(), vec![Operation::Migrate]);
        assert!(store.extension(&key()).is_none());
    }

    #[tokio::test]
    async fn test_force_delete_uses_force_delete_operation() {
        let (store, actuator, reconciler) = setup(false);
        put_deleting(&store, &[(ANNOTATION_FORCE_DELETION, "true")]);

        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(actuator.operations(), vec![Operation::ForceDelete]);
        assert!(store.extension(&key()).is_none());
    }
}
