use super::common::*;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::config::SweeperConfig;
use crate::documents::domain::{
    AcceptedApplication, ApplicationRef, CompanyId, DocumentId, DocumentKey, DocumentRecord,
    DocumentStatus, DocumentType, FreelancerId, ReuseEvent,
};
use crate::documents::notifications::{
    DispatchError, NotificationDispatcher, NotificationKey, NotificationKind,
    NotificationPriority, NotificationRequest, Recipient,
};
use crate::documents::policy::CompanyDocumentPolicy;
use crate::documents::repository::{
    DocumentRepository, NotificationClaim, RepositoryError, SweepLedger,
};
use crate::documents::store::InMemoryDocumentStore;
use crate::documents::sweeper::{SweepError, SweepPass, ValiditySweeper};

#[test]
fn thirty_day_notice_reaches_company_and_freelancer_once() {
    let h = harness();
    let record = h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();

    let report = h.sweeper.run(at(335)).expect("sweep runs");

    assert_eq!(report.notices_created, 1);
    assert_eq!(report.deliveries, 2);
    assert!(report.failures.is_empty());
    let sent = h.notifications.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|request| request.document_id == record.id
        && request.kind == NotificationKind::ExpiryNotice { days_before: 30 }));
    assert!(sent
        .iter()
        .any(|request| request.recipient == Recipient::Company(acme())));
    assert!(sent
        .iter()
        .any(|request| request.recipient == Recipient::Freelancer(ana())));

    let again = h.sweeper.run(at(335)).expect("second sweep runs");
    assert_eq!(again.notices_created, 0);
    assert_eq!(again.duplicates_skipped, 1);
    assert_eq!(h.notifications.sent().len(), 2);
}

#[test]
fn days_between_thresholds_send_nothing() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Cpf, 0);
    h.notifications.clear();

    for day in [300, 334, 336, 349, 360] {
        let report = h.sweeper.run(at(day)).expect("sweep runs");
        assert_eq!(report.notices_created, 0, "day {day}");
    }
    assert!(h.notifications.sent().is_empty());
}

#[test]
fn every_lead_time_fires_with_rising_priority() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Cpf, 0);
    h.notifications.clear();

    for day in [335, 350, 358, 364] {
        h.sweeper.run(at(day)).expect("sweep runs");
    }

    let freelancer_notices: Vec<_> = h
        .notifications
        .sent()
        .into_iter()
        .filter(|request| request.recipient == Recipient::Freelancer(ana()))
        .collect();
    let tags: Vec<_> = freelancer_notices
        .iter()
        .map(|request| request.kind.tag())
        .collect();
    assert_eq!(tags, vec!["30-day", "15-day", "7-day", "1-day"]);
    assert_eq!(freelancer_notices[0].priority, NotificationPriority::Normal);
    assert_eq!(freelancer_notices[2].priority, NotificationPriority::High);
}

#[test]
fn expiration_pass_flips_status_and_notifies_once() {
    let h = harness();
    let record = h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();

    let report = h.sweeper.run(at(366)).expect("sweep runs");

    assert_eq!(report.records_expired, 1);
    assert_eq!(report.notices_created, 1);
    let stored = h.documents.get(&record.id).expect("record exists");
    assert_eq!(stored.status, DocumentStatus::Expired);
    let sent = h.notifications.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|request| request.kind == NotificationKind::Expired
        && request.priority == NotificationPriority::High));

    let again = h.sweeper.run(at(366)).expect("second sweep runs");
    assert_eq!(again.records_expired, 0);
    assert_eq!(again.notices_created, 0);
    assert_eq!(
        h.documents.get(&record.id).expect("record exists").status,
        DocumentStatus::Expired
    );
    assert_eq!(h.notifications.sent().len(), 2);
}

#[test]
fn expiry_day_itself_is_still_valid() {
    let h = harness();
    let record = h.approved(acme(), ana(), DocumentType::Rg, 0);

    let report = h.sweeper.run(at(365)).expect("sweep runs");

    assert_eq!(report.records_expired, 0);
    assert_eq!(
        h.documents.get(&record.id).expect("record exists").status,
        DocumentStatus::Approved
    );
}

#[test]
fn dispatch_failure_is_isolated_and_retried_next_run() {
    let h = harness();
    let broken = h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.approved(acme(), bruno(), DocumentType::Rg, 0);
    h.notifications.clear();
    h.notifications.fail_for(&broken.id);

    let report = h.sweeper.run(at(335)).expect("sweep runs");

    assert_eq!(report.notices_created, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].document_id, broken.id);
    assert_eq!(report.failures[0].pass, SweepPass::ExpiryNotice);

    h.notifications.recover();
    let retry = h.sweeper.run(at(335)).expect("retry runs");
    assert_eq!(retry.notices_created, 1);
    assert_eq!(retry.duplicates_skipped, 1);
    assert!(retry.failures.is_empty());
}

#[test]
fn renewed_approval_gets_fresh_notices() {
    let h = harness();
    h.configure(policy_with(acme(), |policy| policy.allow_overwrite_active = true));
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.sweeper.run(at(335)).expect("first period notice");

    h.approved(acme(), ana(), DocumentType::Rg, 340);
    let report = h.sweeper.run(at(675)).expect("second period notice");

    assert_eq!(report.notices_created, 1);
    assert_eq!(report.duplicates_skipped, 0);
}

#[test]
fn overlapping_runs_are_refused_while_lease_is_live() {
    let h = harness();
    assert!(h
        .store
        .try_acquire_sweep_lease("cron-a", h.wall.now(), Duration::hours(1))
        .expect("lease granted"));

    let err = h.sweeper.run(at(0)).expect_err("lease held");
    assert!(matches!(err, SweepError::AlreadyRunning));
    assert_eq!(err.kind(), "sweep_already_running");

    h.wall.advance(Duration::hours(2));
    let later = h.sweeper.run(at(0));
    assert!(later.is_ok(), "stale lease is taken over");
}

#[test]
fn backdated_run_is_refused_while_a_live_run_holds_the_lease() {
    let h = harness();
    assert!(h
        .store
        .try_acquire_sweep_lease("serve", h.wall.now(), Duration::hours(1))
        .expect("lease granted"));

    let err = h.sweeper.run(at(-200)).expect_err("lease is held in wall time");
    assert!(matches!(err, SweepError::AlreadyRunning));
}

/// Dispatcher that tries to start a live sweep while a delivery is in flight.
struct LeaseContender {
    store: Arc<InMemoryDocumentStore>,
    wall: WallClock,
    granted: Mutex<Vec<bool>>,
}

impl NotificationDispatcher for LeaseContender {
    fn dispatch(&self, _request: NotificationRequest) -> Result<(), DispatchError> {
        let granted = self
            .store
            .try_acquire_sweep_lease(
                "serve",
                self.wall.now() + Duration::minutes(1),
                Duration::hours(1),
            )
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        self.granted
            .lock()
            .expect("contender mutex poisoned")
            .push(granted);
        Ok(())
    }
}

#[test]
fn backdated_run_excludes_live_runs_until_it_finishes() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    let contender = Arc::new(LeaseContender {
        store: h.store.clone(),
        wall: h.wall.clone(),
        granted: Mutex::default(),
    });
    let sweeper = ValiditySweeper::new(h.store.clone(), contender.clone(), &SweeperConfig::default())
        .with_clock(h.wall.clock());

    let report = sweeper.run(at(335)).expect("backdated sweep runs");

    assert_eq!(report.deliveries, 2);
    assert_eq!(
        *contender.granted.lock().expect("contender mutex poisoned"),
        vec![false, false]
    );
    assert!(h
        .store
        .try_acquire_sweep_lease("serve", h.wall.now() + Duration::minutes(1), Duration::hours(1))
        .expect("lease check"));
}

#[test]
fn completed_run_is_recorded_in_wall_time() {
    let h = harness();
    assert_eq!(h.sweeper.last_completed().expect("marker loads"), None);

    h.sweeper.run(at(5)).expect("sweep runs");

    let completed = h.sweeper.last_completed().expect("marker loads");
    assert_eq!(completed, Some(h.wall.now()));
    assert_ne!(completed, Some(at(5)));
}

#[test]
fn partial_delivery_failure_only_redelivers_to_the_missing_recipient() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();
    h.notifications.fail_for_recipient(Recipient::Freelancer(ana()));

    let first = h.sweeper.run(at(335)).expect("sweep runs");
    assert_eq!(first.deliveries, 1);
    assert_eq!(first.notices_created, 0);
    assert_eq!(first.failures.len(), 1);

    h.notifications.recover();
    let second = h.sweeper.run(at(335)).expect("sweep runs again");
    assert_eq!(second.deliveries, 1);
    assert_eq!(second.notices_created, 1);
    assert_eq!(second.duplicates_skipped, 0);
    assert!(second.failures.is_empty());
    assert_eq!(h.notifications.sent_to(&Recipient::Company(acme())).len(), 1);
    assert_eq!(h.notifications.sent_to(&Recipient::Freelancer(ana())).len(), 1);

    let third = h.sweeper.run(at(335)).expect("third sweep runs");
    assert_eq!(third.deliveries, 0);
    assert_eq!(third.duplicates_skipped, 1);
}

#[test]
fn undelivered_notice_is_retried_on_a_later_day() {
    let h = harness();
    let record = h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();
    h.notifications.fail_for_recipient(Recipient::Freelancer(ana()));
    h.sweeper.run(at(335)).expect("sweep runs");

    h.notifications.recover();
    let report = h.sweeper.run(at(336)).expect("next day sweep runs");

    assert_eq!(report.deliveries, 1);
    assert_eq!(report.notices_created, 1);
    let freelancer = h.notifications.sent_to(&Recipient::Freelancer(ana()));
    assert_eq!(freelancer.len(), 1);
    assert_eq!(freelancer[0].document_id, record.id);
    assert_eq!(
        freelancer[0].kind,
        NotificationKind::ExpiryNotice { days_before: 30 }
    );
}

#[test]
fn notice_overtaken_by_expiry_is_dropped() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();
    h.notifications.fail_for_recipient(Recipient::Freelancer(ana()));
    h.sweeper.run(at(364)).expect("one-day notice sweep");

    h.notifications.recover();
    let report = h.sweeper.run(at(366)).expect("expiration sweep");

    assert_eq!(report.records_expired, 1);
    assert_eq!(report.deliveries, 2);
    let kinds: Vec<_> = h
        .notifications
        .sent_to(&Recipient::Freelancer(ana()))
        .into_iter()
        .map(|request| request.kind)
        .collect();
    assert_eq!(kinds, vec![NotificationKind::Expired]);
    assert!(h
        .store
        .pending_notifications()
        .expect("pending loads")
        .is_empty());
}

#[test]
fn failed_expired_notice_is_retried_without_rescanning_old_expirations() {
    let h = harness();
    let record = h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.approved(acme(), bruno(), DocumentType::Rg, 0);
    h.notifications.clear();
    h.notifications.fail_for(&record.id);

    let first = h.sweeper.run(at(366)).expect("expiration sweep");
    assert_eq!(first.records_expired, 2);
    assert_eq!(first.deliveries, 2);
    assert_eq!(first.failures.len(), 1);
    assert_eq!(first.failures[0].pass, SweepPass::Expiration);

    h.notifications.recover();
    let retry = h.sweeper.run(at(367)).expect("retry sweep");
    assert_eq!(retry.records_expired, 0);
    assert_eq!(retry.deliveries, 2);
    assert_eq!(retry.notices_created, 1);

    let quiet = h.sweeper.run(at(368)).expect("quiet sweep");
    assert_eq!(quiet.deliveries, 0);
    assert_eq!(quiet.notices_created, 0);
    assert_eq!(quiet.duplicates_skipped, 0);
}

/// Store wrapper whose lease release or status listing can be made to fail.
struct FlakyLedger {
    inner: InMemoryDocumentStore,
    fail_release: bool,
    fail_listing: bool,
}

impl DocumentRepository for FlakyLedger {
    fn fetch_policy(
        &self,
        company: &CompanyId,
    ) -> Result<Option<CompanyDocumentPolicy>, RepositoryError> {
        self.inner.fetch_policy(company)
    }

    fn insert_policy_if_absent(
        &self,
        policy: CompanyDocumentPolicy,
    ) -> Result<CompanyDocumentPolicy, RepositoryError> {
        self.inner.insert_policy_if_absent(policy)
    }

    fn save_policy(&self, policy: CompanyDocumentPolicy) -> Result<(), RepositoryError> {
        self.inner.save_policy(policy)
    }

    fn insert_document(&self, record: DocumentRecord) -> Result<DocumentRecord, RepositoryError> {
        self.inner.insert_document(record)
    }

    fn fetch_document(&self, id: &DocumentId) -> Result<Option<DocumentRecord>, RepositoryError> {
        self.inner.fetch_document(id)
    }

    fn find_by_key(&self, key: &DocumentKey) -> Result<Option<DocumentRecord>, RepositoryError> {
        self.inner.find_by_key(key)
    }

    fn replace_if_status(
        &self,
        record: DocumentRecord,
        expected: DocumentStatus,
    ) -> Result<(), RepositoryError> {
        self.inner.replace_if_status(record, expected)
    }

    fn set_reuse_eligible(&self, id: &DocumentId, eligible: bool) -> Result<(), RepositoryError> {
        self.inner.set_reuse_eligible(id, eligible)
    }

    fn documents_for_freelancer(
        &self,
        freelancer: &FreelancerId,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        self.inner.documents_for_freelancer(freelancer)
    }

    fn documents_for_company(
        &self,
        company: &CompanyId,
        status: Option<DocumentStatus>,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        self.inner.documents_for_company(company, status)
    }

    fn documents_with_status(
        &self,
        status: DocumentStatus,
    ) -> Result<Vec<DocumentRecord>, RepositoryError> {
        if self.fail_listing {
            return Err(RepositoryError::Unavailable("listing down".to_string()));
        }
        self.inner.documents_with_status(status)
    }

    fn commit_application(
        &self,
        acceptance: AcceptedApplication,
        reuse: Vec<ReuseEvent>,
    ) -> Result<(), RepositoryError> {
        self.inner.commit_application(acceptance, reuse)
    }

    fn fetch_application(
        &self,
        application: &ApplicationRef,
    ) -> Result<Option<AcceptedApplication>, RepositoryError> {
        self.inner.fetch_application(application)
    }

    fn reuse_events_for(&self, document: &DocumentId) -> Result<Vec<ReuseEvent>, RepositoryError> {
        self.inner.reuse_events_for(document)
    }
}

impl SweepLedger for FlakyLedger {
    fn try_acquire_sweep_lease(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        self.inner.try_acquire_sweep_lease(holder, now, ttl)
    }

    fn release_sweep_lease(
        &self,
        holder: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepositoryError> {
        if self.fail_release {
            return Err(RepositoryError::Unavailable("lease table locked".to_string()));
        }
        self.inner.release_sweep_lease(holder, completed_at)
    }

    fn last_sweep_completed(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.inner.last_sweep_completed()
    }

    fn claim_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<NotificationClaim, RepositoryError> {
        self.inner.claim_notification(key, now)
    }

    fn settle_notification(
        &self,
        key: &NotificationKey,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.inner.settle_notification(key, now)
    }

    fn pending_notifications(&self) -> Result<Vec<NotificationKey>, RepositoryError> {
        self.inner.pending_notifications()
    }
}

fn flaky_sweeper(
    h: &Harness,
    fail_release: bool,
    fail_listing: bool,
) -> ValiditySweeper<FlakyLedger, RecordingDispatcher> {
    let store = Arc::new(FlakyLedger {
        inner: (*h.store).clone(),
        fail_release,
        fail_listing,
    });
    ValiditySweeper::new(store, h.notifications.clone(), &SweeperConfig::default())
        .with_clock(h.wall.clock())
}

#[test]
fn failed_lease_release_keeps_the_report() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();
    let sweeper = flaky_sweeper(&h, true, false);

    let report = sweeper.run(at(335)).expect("report survives the release failure");
    assert_eq!(report.notices_created, 1);
    assert_eq!(report.deliveries, 2);

    let err = sweeper.run(at(335)).expect_err("unreleased lease still held");
    assert!(matches!(err, SweepError::AlreadyRunning));
    h.wall.advance(Duration::hours(2));
    let after_ttl = sweeper.run(at(335)).expect("lease lapsed");
    assert_eq!(after_ttl.duplicates_skipped, 1);
}

#[test]
fn pass_error_is_not_masked_by_release_failure() {
    let h = harness();
    let sweeper = flaky_sweeper(&h, true, true);

    let err = sweeper.run(at(335)).expect_err("listing fails");

    assert!(matches!(
        err,
        SweepError::Repository(RepositoryError::Unavailable(ref reason)) if reason == "listing down"
    ));
    assert_eq!(sweeper.last_completed().expect("marker loads"), None);
}

#[test]
fn failed_run_leaves_completion_marker_alone() {
    let h = harness();
    h.sweeper.run(at(5)).expect("sweep runs");
    let recorded = h.sweeper.last_completed().expect("marker loads");

    h.wall.advance(Duration::hours(3));
    let sweeper = flaky_sweeper(&h, false, true);
    sweeper.run(at(6)).expect_err("listing fails");

    assert_eq!(sweeper.last_completed().expect("marker loads"), recorded);
    h.sweeper.run(at(6)).expect("lease was released");
}

#[test]
fn custom_lead_times_replace_defaults() {
    let h = harness();
    h.approved(acme(), ana(), DocumentType::Rg, 0);
    h.notifications.clear();
    let config = SweeperConfig {
        lead_times_days: vec![60],
        ..SweeperConfig::default()
    };
    let sweeper: ValiditySweeper<InMemoryDocumentStore, RecordingDispatcher> =
        ValiditySweeper::new(h.store.clone(), Arc::clone(&h.notifications), &config);

    assert_eq!(sweeper.run(at(335)).expect("sweep runs").notices_created, 0);
    assert_eq!(sweeper.run(at(305)).expect("sweep runs").notices_created, 1);
}
