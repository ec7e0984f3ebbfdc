//! Persistence seams for queues and queued tasks
//!
//! The schema lives outside this crate; callers plug in their own store.
//! The in-memory implementations back the CLI and the tests.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{QueueError, Result};
use crate::model::{Page, Queue, QueuedTask, QueuedTaskStatus};

/// Queue rows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Store a new row; the returned queue carries its assigned id
    async fn insert(&self, queue: Queue) -> Result<Queue>;

    async fn get(&self, id: i64) -> Result<Option<Queue>>;

    async fn find_by_name(&self, name: &str) -> Result<Option<Queue>>;

    /// Replace the row with the same id
    async fn update(&self, queue: &Queue) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;

    /// Rows ordered by id, optionally limited to one project
    async fn list(&self, project_code: Option<i64>, page: usize, page_size: usize) -> Result<Page<Queue>>;
}

/// Whether an upsert created or replaced the record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

/// Queued-task records keyed by task code
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueuedTaskRepository: Send + Sync {
    async fn find(&self, code: i64) -> Result<Option<QueuedTask>>;

    async fn upsert(&self, task: QueuedTask) -> Result<Upserted>;

    /// Set the status of an existing record. Returns false when no record
    /// exists for `code`.
    async fn set_status(&self, code: i64, status: QueuedTaskStatus) -> Result<bool>;

    /// Records of one queue, optionally filtered by status, ordered by code
    async fn list_by_queue(
        &self,
        queue: &str,
        status: Option<QueuedTaskStatus>,
    ) -> Result<Vec<QueuedTask>>;
}

/// [`QueueRepository`] over a concurrent map
#[derive(Debug)]
pub struct InMemoryQueueRepository {
    rows: DashMap<i64, Queue>,
    next_id: AtomicI64,
}

impl Default for InMemoryQueueRepository {
    fn default() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl InMemoryQueueRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn insert(&self, mut queue: Queue) -> Result<Queue> {
        if self.rows.iter().any(|r| r.name == queue.name) {
            return Err(QueueError::QueueExists { name: queue.name });
        }
        queue.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.insert(queue.id, queue.clone());
        Ok(queue)
    }

    async fn get(&self, id: i64) -> Result<Option<Queue>> {
        Ok(self.rows.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Queue>> {
        Ok(self
            .rows
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.value().clone()))
    }

    async fn update(&self, queue: &Queue) -> Result<()> {
        match self.rows.get_mut(&queue.id) {
            Some(mut row) => {
                *row = queue.clone();
                Ok(())
            }
            None => Err(QueueError::NotFound { id: queue.id }),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        self.rows.remove(&id);
        Ok(())
    }

    async fn list(&self, project_code: Option<i64>, page: usize, page_size: usize) -> Result<Page<Queue>> {
        let mut rows: Vec<Queue> = self
            .rows
            .iter()
            .filter(|r| project_code.is_none() || r.project_code == project_code)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|q| q.id);
        Ok(Page::of(rows, page, page_size))
    }
}

/// [`QueuedTaskRepository`] over a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryQueuedTaskRepository {
    rows: DashMap<i64, QueuedTask>,
}

impl InMemoryQueuedTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueuedTaskRepository for InMemoryQueuedTaskRepository {
    async fn find(&self, code: i64) -> Result<Option<QueuedTask>> {
        Ok(self.rows.get(&code).map(|r| r.value().clone()))
    }

    async fn upsert(&self, task: QueuedTask) -> Result<Upserted> {
        match self.rows.entry(task.code) {
            Entry::Occupied(mut e) => {
                e.insert(task);
                Ok(Upserted::Updated)
            }
            Entry::Vacant(e) => {
                e.insert(task);
                Ok(Upserted::Inserted)
            }
        }
    }

    async fn set_status(&self, code: i64, status: QueuedTaskStatus) -> Result<bool> {
        match self.rows.get_mut(&code) {
            Some(mut row) => {
                row.status = status;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_by_queue(
        &self,
        queue: &str,
        status: Option<QueuedTaskStatus>,
    ) -> Result<Vec<QueuedTask>> {
        let mut rows: Vec<QueuedTask> = self
            .rows
            .iter()
            .filter(|r| r.queue == queue && status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|t| t.code);
        Ok(rows)
    }
}
