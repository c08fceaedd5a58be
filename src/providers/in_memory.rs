use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{validate_sequence, HistoryStore, InstanceRecord, ProviderError};
use crate::{ErrorDetails, Event, EventKind, InstanceStatus};

const CAP: usize = 1024;

struct Entry {
    record: InstanceRecord,
    history: Vec<Event>,
}

/// History store kept in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl InMemoryHistoryStore {
    /// Append events verbatim, bypassing sequence assignment.
    ///
    /// Fault-injection hook for corruption tests.
    pub async fn insert_raw_events(&self, instance: &str, events: Vec<Event>) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("insert_raw_events", format!("instance not found: {instance}")))?;
        entry.history.extend(events);
        Ok(())
    }

    /// Pretty dump of every instance, for debugging tests.
    pub async fn dump_all_pretty(&self) -> String {
        let g = self.inner.lock().await;
        let mut out = String::new();
        for (inst, entry) in g.iter() {
            out.push_str(&format!("instance={inst} status={}\n", entry.record.status));
            for e in &entry.history {
                out.push_str(&format!("  {e:?}\n"));
            }
        }
        out
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.contains_key(&record.id) {
            return Err(ProviderError::permanent(
                "create_instance",
                format!("instance already exists: {}", record.id),
            ));
        }
        g.insert(
            record.id.clone(),
            Entry {
                record: record.clone(),
                history: Vec::new(),
            },
        );
        Ok(())
    }

    async fn append(&self, instance: &str, kind: EventKind) -> Result<u64, ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("append", format!("instance not found: {instance}")))?;
        if entry.history.len() >= CAP {
            return Err(ProviderError::permanent(
                "append",
                format!("history cap exceeded (cap={CAP}, instance={instance})"),
            ));
        }
        let seq = entry
            .history
            .last()
            .map(|e| e.sequence_number + 1)
            .unwrap_or(crate::INITIAL_SEQUENCE_NUMBER);
        entry.history.push(Event::new(seq, crate::now_millis(), kind));
        Ok(seq)
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.inner.lock().await;
        let history = match g.get(instance) {
            Some(entry) => entry.history.clone(),
            None => return Ok(Vec::new()),
        };
        validate_sequence(instance, &history)?;
        Ok(history)
    }

    async fn read_instance(&self, instance: &str) -> Result<Option<InstanceRecord>, ProviderError> {
        Ok(self.inner.lock().await.get(instance).map(|e| e.record.clone()))
    }

    async fn update_status(
        &self,
        instance: &str,
        status: InstanceStatus,
        output: Option<String>,
        error: Option<ErrorDetails>,
    ) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let entry = g
            .get_mut(instance)
            .ok_or_else(|| ProviderError::permanent("update_status", format!("instance not found: {instance}")))?;
        entry.record.status = status;
        entry.record.output = output;
        entry.record.error = error;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let g = self.inner.lock().await;
        let mut ids: Vec<(u64, String)> = g.values().map(|e| (e.record.created_at_ms, e.record.id.clone())).collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<String>, ProviderError> {
        let g = self.inner.lock().await;
        let mut ids: Vec<(u64, String)> = g
            .values()
            .filter(|e| e.record.status == status)
            .map(|e| (e.record.created_at_ms, e.record.id.clone()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        if g.remove(instance).is_none() {
            return Err(ProviderError::permanent(
                "remove_instance",
                format!("instance not found: {instance}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(name: &str, attempt: u32) -> EventKind {
        EventKind::ActivityScheduled {
            name: name.to_string(),
            attempt,
            max_attempts: 3,
            input: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn append_assigns_contiguous_sequence_numbers() {
        let store = InMemoryHistoryStore::default();
        store.create_instance(&InstanceRecord::new("i1", "{}")).await.unwrap();
        assert_eq!(store.append("i1", scheduled("a", 1)).await.unwrap(), 1);
        assert_eq!(store.append("i1", scheduled("a", 2)).await.unwrap(), 2);
        let hist = store.read("i1").await.unwrap();
        assert_eq!(hist.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryHistoryStore::default();
        store.create_instance(&InstanceRecord::new("dup", "{}")).await.unwrap();
        let err = store.create_instance(&InstanceRecord::new("dup", "{}")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.message.contains("already exists"));
    }

    #[tokio::test]
    async fn append_to_unknown_instance_fails() {
        let store = InMemoryHistoryStore::default();
        assert!(store.append("missing", scheduled("a", 1)).await.is_err());
        assert!(store.read("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_gap_is_reported_as_corruption() {
        let store = InMemoryHistoryStore::default();
        store.create_instance(&InstanceRecord::new("i1", "{}")).await.unwrap();
        store.append("i1", scheduled("a", 1)).await.unwrap();
        store
            .insert_raw_events("i1", vec![Event::new(5, 0, scheduled("a", 2))])
            .await
            .unwrap();
        assert!(store.read("i1").await.unwrap_err().is_corruption());
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryHistoryStore::default();
        store.create_instance(&InstanceRecord::new("a", "{}")).await.unwrap();
        store.create_instance(&InstanceRecord::new("b", "{}")).await.unwrap();
        store
            .update_status("b", InstanceStatus::Completed, Some("ok".to_string()), None)
            .await
            .unwrap();
        assert_eq!(
            store.list_instances_by_status(InstanceStatus::Running).await.unwrap(),
            vec!["a".to_string()]
        );
        let rec = store.read_instance("b").await.unwrap().unwrap();
        assert_eq!(rec.output.as_deref(), Some("ok"));
        store.remove_instance("b").await.unwrap();
        assert!(store.read_instance("b").await.unwrap().is_none());
    }
}
