//! BackupSession creation for the trigger CronJob
//!
//! Each schedule tick the trigger CronJob runs `create-backup-run`, which
//! lands here.

use tracing::info;

use cadence_common::crd::{BackupSession, BackupSessionSpec, InvokerRef};
use cadence_common::{Result, CADENCE_GROUP};

use crate::client::SchedulerKubeClient;
use crate::invoker::{BackupInvoker, InvokerKind};

/// BackupSession for one run of `invoker`
pub fn backup_session_for(invoker: &BackupInvoker) -> BackupSession {
    let mut session = BackupSession::new(
        "",
        BackupSessionSpec {
            invoker: InvokerRef {
                api_group: CADENCE_GROUP.to_string(),
                kind: invoker.kind.as_str().to_string(),
                name: invoker.name.clone(),
            },
        },
    );
    session.metadata.name = None;
    session.metadata.generate_name = Some(format!("{}-", invoker.name));
    session.metadata.namespace = Some(invoker.namespace.clone());
    if !invoker.labels.is_empty() {
        session.metadata.labels = Some(invoker.labels.clone());
    }
    session.metadata.owner_references = Some(vec![invoker.owner_reference()]);
    session
}

/// Create a BackupSession for the named invoker
///
/// Returns the generated session name, or `None` when the invoker no longer
/// exists or is paused.
pub async fn create_backup_run(
    client: &dyn SchedulerKubeClient,
    kind: InvokerKind,
    namespace: &str,
    name: &str,
) -> Result<Option<String>> {
    let Some(invoker) = client.get_invoker(kind, namespace, name).await? else {
        info!(invoker = %name, namespace = %namespace, "Backup invoker not found, nothing to run");
        return Ok(None);
    };
    if invoker.paused {
        info!(invoker = %name, namespace = %namespace, "Backup invoker is paused, skipping run");
        return Ok(None);
    }

    let created = client
        .create_backup_session(&backup_session_for(&invoker))
        .await?;
    info!(invoker = %name, session = %created, "BackupSession created");
    Ok(Some(created))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockSchedulerKubeClient;
    use crate::invoker::tests::sample_invoker;
    use cadence_common::Error;

    #[test]
    fn session_references_invoker_and_copies_labels() {
        let invoker = sample_invoker("nightly");
        let session = backup_session_for(&invoker);

        assert_eq!(session.metadata.name, None);
        assert_eq!(session.metadata.generate_name.as_deref(), Some("nightly-"));
        assert_eq!(session.metadata.namespace.as_deref(), Some("demo"));
        assert_eq!(
            session.metadata.labels.as_ref().and_then(|l| l.get("app")),
            Some(&"web".to_string())
        );
        assert_eq!(session.spec.invoker.api_group, "cadence.dev");
        assert_eq!(session.spec.invoker.kind, "BackupConfiguration");
        assert_eq!(session.spec.invoker.name, "nightly");

        let owners = session.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, "uid-nightly");
    }

    #[tokio::test]
    async fn story_trigger_tick_creates_session() {
        let mut client = MockSchedulerKubeClient::new();
        client
            .expect_get_invoker()
            .returning(|_, _, name| Ok(Some(sample_invoker(name))));
        client
            .expect_create_backup_session()
            .times(1)
            .returning(|session| {
                assert_eq!(session.spec.invoker.name, "nightly");
                Ok("nightly-x7k2p".to_string())
            });

        let created =
            create_backup_run(&client, InvokerKind::BackupConfiguration, "demo", "nightly")
                .await
                .unwrap();
        assert_eq!(created.as_deref(), Some("nightly-x7k2p"));
    }

    #[tokio::test]
    async fn story_paused_or_missing_invoker_creates_nothing() {
        let mut client = MockSchedulerKubeClient::new();
        client.expect_get_invoker().returning(|_, _, name| {
            if name == "gone" {
                return Ok(None);
            }
            let mut invoker = sample_invoker(name);
            invoker.paused = true;
            Ok(Some(invoker))
        });
        client.expect_create_backup_session().never();

        for name in ["gone", "paused"] {
            let created =
                create_backup_run(&client, InvokerKind::BackupConfiguration, "demo", name)
                    .await
                    .unwrap();
            assert_eq!(created, None);
        }
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let mut client = MockSchedulerKubeClient::new();
        client
            .expect_get_invoker()
            .returning(|_, _, name| Ok(Some(sample_invoker(name))));
        client
            .expect_create_backup_session()
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let result =
            create_backup_run(&client, InvokerKind::BackupBatch, "demo", "nightly").await;
        assert!(result.is_err());
    }
}
