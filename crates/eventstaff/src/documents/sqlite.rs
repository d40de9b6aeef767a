use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::domain::{
    AcceptedApplication, ApplicationRef, CompanyId, DocumentId, DocumentKey, DocumentRecord,
    DocumentStatus, DocumentType, FileReference, FreelancerId, ReviewerId, ReuseEvent,
};
use super::notifications::{NotificationKey, Recipient};
use super::policy::CompanyDocumentPolicy;
use super::repository::{DocumentRepository, NotificationClaim, RepositoryError, SweepLedger};

const SWEEPER_LEASE: &str = "validity_sweeper";

const RECORD_COLUMNS: &str = "id, company_id, freelancer_id, doc_type, status, storage_key, \
     content_type, uploaded_at, expires_at, approved_at, reviewer, notes, reuse_eligible, \
     reuse_count";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS document_policies (
        company_id TEXT PRIMARY KEY,
        policy TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS document_records (
        id TEXT PRIMARY KEY,
        company_id TEXT NOT NULL,
        freelancer_id TEXT NOT NULL,
        doc_type TEXT NOT NULL,
        status TEXT NOT NULL,
        storage_key TEXT NOT NULL,
        content_type TEXT NOT NULL,
        uploaded_at TEXT NOT NULL,
        expires_at TEXT,
        approved_at TEXT,
        reviewer TEXT,
        notes TEXT NOT NULL,
        reuse_eligible INTEGER NOT NULL,
        reuse_count INTEGER NOT NULL DEFAULT 0,
        UNIQUE (company_id, freelancer_id, doc_type)
    );
    CREATE INDEX IF NOT EXISTS idx_document_records_status ON document_records(status);
    CREATE INDEX IF NOT EXISTS idx_document_records_freelancer ON document_records(freelancer_id);
    CREATE TABLE IF NOT EXISTS accepted_applications (
        application_ref TEXT PRIMARY KEY,
        company_id TEXT NOT NULL,
        freelancer_id TEXT NOT NULL,
        accepted_at TEXT NOT NULL,
        complete_documentation INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS reuse_events (
        document_id TEXT NOT NULL REFERENCES document_records(id),
        application_ref TEXT NOT NULL,
        reused_at TEXT NOT NULL,
        status_at_reuse TEXT NOT NULL,
        UNIQUE (document_id, application_ref)
    );
    CREATE TABLE IF NOT EXISTS sweep_notifications (
        tag TEXT NOT NULL,
        document_id TEXT NOT NULL,
        expires_on TEXT NOT NULL,
        recipient_kind TEXT NOT NULL,
        recipient_id TEXT NOT NULL,
        claimed_at TEXT NOT NULL,
        settled_at TEXT,
        PRIMARY KEY (tag, document_id, expires_on, recipient_kind, recipient_id)
    );
    CREATE INDEX IF NOT EXISTS idx_sweep_notifications_unsettled
        ON sweep_notifications(claimed_at) WHERE settled_at IS NULL;
    CREATE TABLE IF NOT EXISTS sweep_leases (
        name TEXT PRIMARY KEY,
        holder TEXT,
        expires_at TEXT,
        last_completed TEXT
    );
";

/// SQLite-backed store; the unique constraints carry the data-model invariants.
pub struct SqliteDocumentStore {
    conn: Mutex<Connection>,
}

impl SqliteDocumentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, RepositoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        self.conn
            .lock()
            .map_err(|_| RepositoryError::Unavailable("sqlite connection mutex poisoned".to_string()))
    }

    fn query_records(
        &self,
        filter: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {RECORD_COLUMNS} FROM document_records {filter} ORDER BY uploaded_at, id");
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map(params, row_to_record)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(value: rusqlite::Error) -> Self {
        match &value {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                RepositoryError::Conflict
            }
            _ => RepositoryError::Unavailable(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(value: serde_json::Error) -> Self {
        RepositoryError::Unavailable(format!("stored policy is malformed: {value}"))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown stored code '{0}'")]
struct UnknownCode(String);

fn unknown_code(column: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(UnknownCode(value)))
}

fn row_to_record(row: &Row<'_>) -> Result<DocumentRecord, rusqlite::Error> {
    let doc_type: String = row.get(3)?;
    let doc_type = DocumentType::from_code(&doc_type).ok_or_else(|| unknown_code(3, doc_type))?;
    let status: String = row.get(4)?;
    let status = DocumentStatus::from_label(&status).ok_or_else(|| unknown_code(4, status))?;

    Ok(DocumentRecord {
        id: DocumentId(row.get(0)?),
        company: CompanyId(row.get(1)?),
        freelancer: FreelancerId(row.get(2)?),
        doc_type,
        status,
        file: FileReference {
            storage_key: row.get(5)?,
            content_type: row.get(6)?,
        },
        uploaded_at: row.get(7)?,
        expires_at: row.get(8)?,
        approved_at: row.get(9)?,
        reviewer: row.get::<_, Option<String>>(10)?.map(ReviewerId),
        notes: row.get(11)?,
        reuse_eligible: row.get(12)?,
        reuse_count: row.get(13)?,
    })
}

fn row_to_reuse_event(row: &Row<'_>) -> Result<ReuseEvent, rusqlite::Error> {
    let status: String = row.get(3)?;
    let status_at_reuse =
        DocumentStatus::from_label(&status).ok_or_else(|| unknown_code(3, status))?;
    Ok(ReuseEvent {
        source_document: DocumentId(row.get(0)?),
        application: ApplicationRef(row.get(1)?),
        reused_at: row.get(2)?,
        status_at_reuse,
    })
}

fn stored_status(conn: &Connection, id: &DocumentId) -> Result<Option<DocumentStatus>, RepositoryError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM document_records WHERE id = ?1",
            params![&id.0],
            |row| row.get(0),
        )
        .optional()?;
    Ok(status.and_then(|status| DocumentStatus::from_label(&status)))
}

impl DocumentRepository for SqliteDocumentStore {
    fn fetch_policy(
        &self,
        company: &CompanyId,
    ) -> Result<Option<CompanyDocumentPolicy>, RepositoryError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT policy FROM document_policies WHERE company_id = ?1",
                params![&company.0],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(RepositoryError::from))
            .transpose()
    }

    fn insert_policy_if_absent(
        &self,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO document_policies (company_id, policy) VALUES (?1, ?2)",
            params![&policy.company.0, serde_json::to_string(&policy)?],
        )?;
        let raw: String = tx.query_row(
            "SELECT policy FROM document_policies WHERE company_id = ?1",
            params![&policy.company.0],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn save_policy(&self, policy: CompanyDocumentPolicy) -> Result<(), RepositoryError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO document_policies (company_id, policy) VALUES (?1, ?2)
             ON CONFLICT(company_id) DO UPDATE SET policy = excluded.policy",
            params![&policy.company.0, serde_json::to_string(&policy)?],
        )?;
        Ok(())
    }

    fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord, RepositoryError> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO document_records ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                &record.id.0,
                &record.company.0,
                &record.freelancer.0,
                record.doc_type.code(),
                record.status.label(),
                &record.file.storage_key,
                &record.file.content_type,
                &record.uploaded_at,
                &record.expires_at,
                &record.approved_at,
                record.reviewer.as_ref().map(|reviewer| reviewer.0.as_str()),
                &record.notes,
                record.reuse_eligible,
                record.reuse_count,
            ],
        )?;
        Ok(record)
    }

    fn fetch_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, RepositoryError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM document_records WHERE id = ?1"),
                params![&id.0],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn find_by_key(&self, key: &DocumentKey) -> Result<Option<DocumentRecord>, RepositoryError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM document_records
                     WHERE company_id = ?1 AND freelancer_id = ?2 AND doc_type = ?3"
                ),
                params![&key.company.0, &key.freelancer.0, key.doc_type.code()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn replace_if_status(
        &self,
        record: DocumentRecord,
        expected: DocumentStatus,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE document_records
             SET status = ?1, storage_key = ?2, content_type = ?3, uploaded_at = ?4,
                 expires_at = ?5, approved_at = ?6, reviewer = ?7, notes = ?8,
                 reuse_eligible = ?9
             WHERE id = ?10 AND status = ?11",
            params![
                record.status.label(),
                &record.file.storage_key,
                &record.file.content_type,
                &record.uploaded_at,
                &record.expires_at,
                &record.approved_at,
                record.reviewer.as_ref().map(|reviewer| reviewer.0.as_str()),
                &record.notes,
                record.reuse_eligible,
                &record.id.0,
                expected.label(),
            ],
        )?;

        if changed == 0 {
            return match stored_status(&tx, &record.id)? {
                Some(found) => Err(RepositoryError::StatusMismatch { expected, found }),
                None => Err(RepositoryError::NotFound),
            };
        }

        tx.commit()?;
        Ok(())
    }

    fn set_reuse_eligible(&self, id: &DocumentId, eligible: bool) -> Result<(), RepositoryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE document_records SET reuse_eligible = ?1 WHERE id = ?2",
            params![eligible, &id.0],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    fn documents_for_freelancer(
        &self,
        freelancer: &FreelancerId,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        self.query_records("WHERE freelancer_id = ?1", &[&freelancer.0])
    }

    fn documents_for_company(
        &self,
        company: &CompanyId,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        match status {
            Some(status) => self.query_records(
                "WHERE company_id = ?1 AND status = ?2",
                &[&company.0, &status.label()],
            ),
            None => self.query_records("WHERE company_id = ?1", &[&company.0]),
        }
    }

    fn documents_with_status(
        &self,
        status: DocumentStatus,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        self.query_records("WHERE status = ?1", &[&status.label()])
    }

    fn commit_application(
        &self,
        acceptance: AcceptedApplication,
        reuse: Vec<ReuseEvent>,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.lock()?;
        // Dropping the transaction without commit rolls everything back.
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO accepted_applications
             (application_ref, company_id, freelancer_id, accepted_at, complete_documentation)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                &acceptance.application.0,
                &acceptance.company.0,
                &acceptance.freelancer.0,
                &acceptance.accepted_at,
                acceptance.complete_documentation,
            ],
        )?;

        for event in &reuse {
            let bumped = tx.execute(
                "UPDATE document_records SET reuse_count = reuse_count + 1
                 WHERE id = ?1 AND status = ?2",
                params![&event.source_document.0, DocumentStatus::Approved.label()],
            )?;
            if bumped == 0 {
                return match stored_status(&tx, &event.source_document)? {
                    Some(found) => Err(RepositoryError::StatusMismatch {
                        expected: DocumentStatus::Approved,
                        found,
                    }),
                    None => Err(RepositoryError::NotFound),
                };
            }
            tx.execute(
                "INSERT INTO reuse_events (document_id, application_ref, reused_at, status_at_reuse)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    &event.source_document.0,
                    &event.application.0,
                    &event.reused_at,
                    event.status_at_reuse.label(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn fetch_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<Option<AcceptedApplication>, RepositoryError> {
        let conn = self.lock()?;
        let accepted = conn
            .query_row(
                "SELECT application_ref, company_id, freelancer_id, accepted_at, complete_documentation
                 FROM accepted_applications WHERE application_ref = ?1",
                params![&application.0],
                |row| {
                    Ok(AcceptedApplication {
                        application: ApplicationRef(row.get(0)?),
                        company: CompanyId(row.get(1)?),
                        freelancer: FreelancerId(row.get(2)?),
                        accepted_at: row.get(3)?,
                        complete_documentation: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(accepted)
    }

    fn reuse_events_for(&self, document: &DocumentId) -> Result<Vec<ReuseEvent>, RepositoryError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT document_id, application_ref, reused_at, status_at_reuse
             FROM reuse_events WHERE document_id = ?1 ORDER BY reused_at",
        )?;
        let rows = statement.query_map(params![&document.0], row_to_reuse_event)?;
        let events = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

impl SweepLedger for SqliteDocumentStore {
    fn try_acquire_sweep_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current: Option<(Option<String>, Option<DateTime<Utc>>)> = tx
            .query_row(
                "SELECT holder, expires_at FROM sweep_leases WHERE name = ?1",
                params![SWEEPER_LEASE],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((Some(_), Some(expires_at))) = current {
            if expires_at > now {
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT INTO sweep_leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at",
            params![SWEEPER_LEASE, holder, now + ttl],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn release_sweep_lease(
        &self,
        holder: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sweep_leases SET holder = NULL, expires_at = NULL
             WHERE name = ?1 AND holder = ?2",
            params![SWEEPER_LEASE, holder],
        )?;
        if let Some(completed_at) = completed_at {
            tx.execute(
                "INSERT INTO sweep_leases (name, last_completed) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET last_completed = excluded.last_completed",
                params![SWEEPER_LEASE, completed_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn last_sweep_completed(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let conn = self.lock()?;
        let completed: Option<Option<DateTime<Utc>>> = conn
            .query_row(
                "SELECT last_completed FROM sweep_leases WHERE name = ?1",
                params![SWEEPER_LEASE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(completed.flatten())
    }

    fn claim_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<NotificationClaim, RepositoryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (recipient_kind, recipient_id) = recipient_columns(&key.recipient);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO sweep_notifications
                 (tag, document_id, expires_on, recipient_kind, recipient_id, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &key.tag,
                &key.document_id.0,
                expires_on(key),
                recipient_kind,
                recipient_id,
                now
            ],
        )?;
        let claim = if inserted == 1 {
            NotificationClaim::New
        } else {
            let settled: Option<DateTime<Utc>> = tx.query_row(
                "SELECT settled_at FROM sweep_notifications
                 WHERE tag = ?1 AND document_id = ?2 AND expires_on = ?3
                   AND recipient_kind = ?4 AND recipient_id = ?5",
                params![
                    &key.tag,
                    &key.document_id.0,
                    expires_on(key),
                    recipient_kind,
                    recipient_id
                ],
                |row| row.get(0),
            )?;
            match settled {
                Some(_) => NotificationClaim::Settled,
                None => NotificationClaim::Pending,
            }
        };
        tx.commit()?;
        Ok(claim)
    }

    fn settle_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let conn = self.lock()?;
        let (recipient_kind, recipient_id) = recipient_columns(&key.recipient);
        let updated = conn.execute(
            "UPDATE sweep_notifications SET settled_at = COALESCE(settled_at, ?6)
             WHERE tag = ?1 AND document_id = ?2 AND expires_on = ?3
               AND recipient_kind = ?4 AND recipient_id = ?5",
            params![
                &key.tag,
                &key.document_id.0,
                expires_on(key),
                recipient_kind,
                recipient_id,
                now
            ],
        )?;
        if updated == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    fn pending_notifications(&self) -> Result<Vec<NotificationKey>, RepositoryError> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT tag, document_id, expires_on, recipient_kind, recipient_id
             FROM sweep_notifications WHERE settled_at IS NULL ORDER BY claimed_at",
        )?;
        let rows = statement.query_map([], row_to_notification_key)?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

fn expires_on(key: &NotificationKey) -> String {
    key.expires_on
        .map(|date| date.to_string())
        .unwrap_or_default()
}

fn recipient_columns(recipient: &Recipient) -> (&'static str, &str) {
    match recipient {
        Recipient::Company(company) => ("company", company.0.as_str()),
        Recipient::Freelancer(freelancer) => ("freelancer", freelancer.0.as_str()),
    }
}

fn row_to_notification_key(row: &Row<'_>) -> Result<NotificationKey, rusqlite::Error> {
    let expires_on: String = row.get(2)?;
    let expires_on = if expires_on.is_empty() {
        None
    } else {
        Some(
            NaiveDate::parse_from_str(&expires_on, "%Y-%m-%d")
                .map_err(|_| unknown_code(2, expires_on))?,
        )
    };
    let recipient_kind: String = row.get(3)?;
    let recipient_id: String = row.get(4)?;
    let recipient = match recipient_kind.as_str() {
        "company" => Recipient::Company(CompanyId(recipient_id)),
        "freelancer" => Recipient::Freelancer(FreelancerId(recipient_id)),
        _ => return Err(unknown_code(3, recipient_kind)),
    };
    Ok(NotificationKey {
        tag: row.get(0)?,
        document_id: DocumentId(row.get(1)?),
        expires_on,
        recipient,
    })
}
