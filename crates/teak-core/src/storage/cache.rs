//! Durable queue for requests that must survive process death.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::database::{CacheDatabase, CacheLease};
use super::error::StorageResult;
use crate::events::{EventBus, TeakEvent};
use crate::request::{Payload, Request, RequestContext, RequestEngine, Response, ResponseCallback};
use crate::sync::{SerialExecutor, lock};

/// One row of the `cache` table.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRequestRecord {
    pub rowid: i64,
    pub endpoint: String,
    pub payload: Payload,
    pub request_id: String,
    pub issued_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Wraps requests in a database row that lives from issuance until a
/// non-5xx response.
///
/// Persistence failures are logged and never block delivery.
pub struct PersistentRequestCache {
    db: Arc<CacheDatabase>,
    _lease: CacheLease,
    engine: RequestEngine,
    bus: EventBus,
    executor: SerialExecutor,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

/// Marks a row as owned by a pending send. The row is released when the
/// completion runs or when the engine drops the request without one.
struct InFlight {
    rows: Arc<Mutex<HashSet<i64>>>,
    rowid: i64,
}

impl InFlight {
    fn claim(rows: &Arc<Mutex<HashSet<i64>>>, rowid: i64) -> Self {
        lock(rows).insert(rowid);
        Self { rows: Arc::clone(rows), rowid }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.rows).remove(&self.rowid);
    }
}

impl std::fmt::Debug for PersistentRequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentRequestCache").field("db", &self.db).finish_non_exhaustive()
    }
}

impl PersistentRequestCache {
    /// Open the cache, keeping the database open for the cache's lifetime.
    ///
    /// Row updates after each response run on a serial executor spawned on
    /// `handle`, followed by the caller's callback.
    ///
    /// # Errors
    /// * `StorageError::Connection` - If the database cannot be opened
    pub fn open(handle: &Handle, db: Arc<CacheDatabase>, engine: RequestEngine, bus: EventBus) -> StorageResult<Self> {
        let lease = db.open()?;
        Ok(Self {
            db,
            _lease: lease,
            engine,
            bus,
            executor: SerialExecutor::spawn(handle, "cache"),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Persist, then send, a request for `endpoint`. Returns its request id.
    pub fn submit(
        &self,
        context: &RequestContext,
        endpoint: &str,
        payload: Payload,
        callback: Option<ResponseCallback>,
    ) -> String {
        let request = Request::new(context, endpoint, payload);
        let request_id = request.request_id().to_string();
        let rowid = match self.insert(&request) {
            Ok(rowid) => {
                self.bus.post(TeakEvent::RequestCached {
                    request_id: request_id.clone(),
                    endpoint: endpoint.to_string(),
                });
                Some(rowid)
            }
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Could not cache request, sending anyway");
                None
            }
        };
        self.send(request, rowid, callback);
        request_id
    }

    /// Every cached row, fewest retries first.
    pub fn load(&self) -> StorageResult<Vec<CachedRequestRecord>> {
        read_records(&self.db)
    }

    /// Resend every cached row not already in flight. Returns how many were
    /// resent.
    ///
    /// A row stops being in flight once its response is handled or the
    /// engine drops the request, so rows dropped on a transport error are
    /// picked up again by the next call.
    pub fn resubmit_all(&self, context: &RequestContext) -> usize {
        let records = match self.load() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not load cached requests");
                return 0;
            }
        };

        let mut resubmitted = 0;
        for record in records {
            if lock(&self.in_flight).contains(&record.rowid) {
                continue;
            }
            let request = Request::raw(context, record.endpoint.as_str(), record.payload)
                .with_request_id(record.request_id.as_str());
            self.send(request, Some(record.rowid), None);
            resubmitted += 1;
        }
        if resubmitted > 0 {
            info!(count = resubmitted, "Resubmitted cached requests");
        }
        resubmitted
    }

    fn insert(&self, request: &Request) -> StorageResult<i64> {
        let payload = serde_json::to_string(request.payload())?;
        let lease = self.db.open()?;
        lease.with_connection(|conn| {
            conn.execute(
                "INSERT INTO cache (request_endpoint, request_payload, request_id, request_date, retry_count)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![request.endpoint(), payload, request.request_id(), Utc::now().timestamp()],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn send(&self, request: Request, rowid: Option<i64>, callback: Option<ResponseCallback>) {
        let claim = rowid.map(|rowid| InFlight::claim(&self.in_flight, rowid));
        let db = Arc::clone(&self.db);
        let bus = self.bus.clone();
        let executor = self.executor.clone();
        let request_id = request.request_id().to_string();

        self.engine.submit_request(
            request,
            Some(Box::new(move |response: Response| {
                let queued = executor.execute(move || {
                    if let Some(claim) = claim {
                        resolve(&db, &bus, claim.rowid, &request_id, &response);
                    }
                    if let Some(callback) = callback {
                        callback(response);
                    }
                });
                if !queued {
                    warn!("Cache executor is gone, dropping completion");
                }
            })),
        );
    }
}

fn resolve(db: &Arc<CacheDatabase>, bus: &EventBus, rowid: i64, request_id: &str, response: &Response) {
    let deleted = !response.is_retryable();
    let result = db.open().and_then(|lease| {
        lease.with_connection(|conn| {
            if deleted {
                conn.execute("DELETE FROM cache WHERE rowid = ?1", params![rowid])?;
            } else {
                conn.execute("UPDATE cache SET retry_count = retry_count + 1 WHERE rowid = ?1", params![rowid])?;
            }
            Ok(())
        })
    });
    if let Err(e) = result {
        warn!(request_id = %request_id, rowid, error = %e, "Could not update cached request");
        return;
    }
    bus.post(TeakEvent::CachedRequestResolved { request_id: request_id.to_string(), status: response.status, deleted });
}

fn load_records(conn: &Connection) -> StorageResult<Vec<CachedRequestRecord>> {
    let mut stmt = conn.prepare(
        "SELECT rowid, request_endpoint, request_payload, request_id, request_date, retry_count
         FROM cache ORDER BY retry_count ASC, rowid ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<i64>>(4)?,
            row.get::<_, Option<i64>>(5)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (rowid, endpoint, payload, request_id, request_date, retry_count) = row?;
        let payload: Payload = match payload.as_deref().map(serde_json::from_str::<Payload>).transpose() {
            Ok(payload) => payload.unwrap_or_default(),
            Err(e) => {
                warn!(rowid, error = %e, "Skipping cached request with unreadable payload");
                continue;
            }
        };
        records.push(CachedRequestRecord {
            rowid,
            endpoint: endpoint.unwrap_or_default(),
            payload,
            request_id: request_id.unwrap_or_default(),
            issued_at: request_date.and_then(|secs| DateTime::from_timestamp(secs, 0)).unwrap_or_default(),
            retry_count: u32::try_from(retry_count.unwrap_or(0)).unwrap_or(0),
        });
    }
    Ok(records)
}

/// Read every row from a cache database without sending anything.
pub fn read_records(db: &Arc<CacheDatabase>) -> StorageResult<Vec<CachedRequestRecord>> {
    let lease = db.open()?;
    lease.with_connection(load_records)
}
