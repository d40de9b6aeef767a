use crate::infra::{start_of_day, InMemoryNotificationOutbox};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::Args;
use eventstaff::config::SweeperConfig;
use eventstaff::documents::{
    Actor, ApplicationRef, ApplicationRequest, CompanyDocumentPolicy, CompanyId,
    DocumentEvaluation, DocumentEventBus, DocumentService, DocumentType, FreelancerId,
    InMemoryDocumentStore, NotificationRequest, Recipient, RequirementScope, ReuseError,
    ReuseEvaluator, SweepReport, TransitionNotifier, UploadRequest, ValiditySweeper,
};
use eventstaff::error::AppError;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Date the walkthrough starts on (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) as_of: Option<NaiveDate>,
    /// Print every notification the walkthrough produces.
    #[arg(long)]
    pub(crate) show_notifications: bool,
}

struct DemoContext {
    outbox: InMemoryNotificationOutbox,
    documents: DocumentService<InMemoryDocumentStore>,
    reuse: ReuseEvaluator<InMemoryDocumentStore>,
    sweeper: ValiditySweeper<InMemoryDocumentStore, InMemoryNotificationOutbox>,
    show_notifications: bool,
}

impl DemoContext {
    fn new(show_notifications: bool) -> Self {
        let store = Arc::new(InMemoryDocumentStore::default());
        let outbox = InMemoryNotificationOutbox::default();
        let dispatcher = Arc::new(outbox.clone());
        let events = DocumentEventBus::new()
            .subscribe(Arc::new(TransitionNotifier::new(dispatcher.clone())));
        Self {
            documents: DocumentService::new(store.clone(), events.clone()),
            reuse: ReuseEvaluator::new(store.clone(), events.clone()),
            sweeper: ValiditySweeper::new(store, dispatcher, &SweeperConfig::default())
                .with_events(events),
            outbox,
            show_notifications,
        }
    }

    fn flush_notifications(&self) {
        let sent = self.outbox.drain();
        if !self.show_notifications || sent.is_empty() {
            return;
        }
        println!("  Notifications:");
        for request in sent {
            println!("    - {}", describe_notification(&request));
        }
    }
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let start = args
        .as_of
        .map(start_of_day)
        .unwrap_or_else(Utc::now);
    let ctx = DemoContext::new(args.show_notifications);

    let acme = CompanyId("acme-eventos".to_string());
    let globex = CompanyId("globex-producoes".to_string());
    let ana = FreelancerId("ana-souza".to_string());
    let acme_reviewer = Actor::CompanyUser {
        company: acme.clone(),
        user: "rh-acme".to_string(),
    };
    let ana_actor = Actor::Freelancer {
        freelancer: ana.clone(),
    };

    println!("=== Freelancer Document Demo ===");
    println!("Starting on {}", start.date_naive());

    println!("\n1. Company policy");
    let mut policy = CompanyDocumentPolicy::default_for(acme.clone());
    policy.accepts_external_documents = true;
    let policy = ctx.documents.update_policy(&acme_reviewer, policy)?;
    println!(
        "- {} requires {} (validity {} days, accepts external documents: {})",
        policy.company,
        join_labels(&policy.mandatory_types()),
        policy.default_validity_days,
        policy.accepts_external_documents
    );

    println!("\n2. Upload and review");
    let rg = ctx.documents.upload(
        &ana_actor,
        upload(&acme, &ana, DocumentType::Rg, "rg-frente.jpg"),
        start,
    )?;
    let rg = ctx
        .documents
        .approve(&acme_reviewer, &rg.id, Some("legivel".to_string()), start)?;
    println!(
        "- {} {} approved until {}",
        rg.doc_type.label(),
        rg.id,
        expiry_label(rg.expires_at)
    );

    let cpf = ctx.documents.upload(
        &ana_actor,
        upload(&acme, &ana, DocumentType::Cpf, "cpf.pdf"),
        start,
    )?;
    let cpf = ctx
        .documents
        .reject(&acme_reviewer, &cpf.id, "numero ilegivel, reenviar")?;
    println!("- {} {} rejected: {}", cpf.doc_type.label(), cpf.id, cpf.notes);
    ctx.flush_notifications();

    println!("\n3. Application check before resubmission");
    let first_check = ctx
        .reuse
        .check(&ana, &acme, &RequirementScope::default(), start)?;
    print_evaluation(&first_check.evaluation);
    println!("- can apply: {}", first_check.can_apply);
    match ctx.reuse.apply(
        application(&ana, &acme, "vaga-festival-verao"),
        start,
    ) {
        Err(ReuseError::IncompleteDocumentation { evaluation }) => println!(
            "- application blocked, missing {}",
            join_labels(&evaluation.unsatisfied())
        ),
        Err(err) => return Err(err.into()),
        Ok(_) => println!("- application unexpectedly accepted"),
    }

    println!("\n4. Resubmission and application");
    let later = start + Duration::days(2);
    let cpf = ctx.documents.upload(
        &ana_actor,
        upload(&acme, &ana, DocumentType::Cpf, "cpf-novo.pdf"),
        later,
    )?;
    let cpf = ctx.documents.approve(&acme_reviewer, &cpf.id, None, later)?;
    let outcome = ctx
        .reuse
        .apply(application(&ana, &acme, "vaga-festival-verao"), later)?;
    println!(
        "- application {} accepted with {} reused documents",
        outcome.acceptance.application,
        outcome.reuse_events.len()
    );
    let second = ctx
        .reuse
        .apply(application(&ana, &acme, "vaga-feira-livro"), later)?;
    println!(
        "- application {} accepted; RG reused {} times",
        second.acceptance.application,
        ctx.documents.get(&rg.id)?.reuse_count
    );
    ctx.flush_notifications();

    println!("\n5. Cross-company reuse");
    let outcome = ctx.reuse.check(&ana, &globex, &RequirementScope::default(), later)?;
    println!(
        "- {} does not accept external documents: can apply {}",
        globex, outcome.can_apply
    );
    let globex_reviewer = Actor::CompanyUser {
        company: globex.clone(),
        user: "rh-globex".to_string(),
    };
    let mut globex_policy = CompanyDocumentPolicy::default_for(globex.clone());
    globex_policy.accepts_external_documents = true;
    ctx.documents.update_policy(&globex_reviewer, globex_policy)?;
    let outcome = ctx.reuse.check(&ana, &globex, &RequirementScope::default(), later)?;
    print_evaluation(&outcome.evaluation);
    println!("- after opting in: can apply {}", outcome.can_apply);

    println!("\n6. Validity sweeps");
    let expiry = cpf.expires_at.unwrap_or(later);
    for days_before in [30, 7, 1] {
        let day = expiry - Duration::days(days_before);
        let report = ctx.sweeper.run(day)?;
        print_sweep(day, &report);
        ctx.flush_notifications();
    }
    let after_expiry = expiry + Duration::days(1);
    let report = ctx.sweeper.run(after_expiry)?;
    print_sweep(after_expiry, &report);
    ctx.flush_notifications();
    let report = ctx.sweeper.run(after_expiry)?;
    print_sweep(after_expiry, &report);

    let final_check = ctx
        .reuse
        .check(&ana, &acme, &RequirementScope::default(), after_expiry)?;
    print_evaluation(&final_check.evaluation);
    if let Some(at) = ctx.sweeper.last_completed()? {
        println!("- last sweep completed at {}", at.date_naive());
    }

    Ok(())
}

fn upload(
    company: &CompanyId,
    freelancer: &FreelancerId,
    doc_type: DocumentType,
    file: &str,
) -> UploadRequest {
    UploadRequest {
        company: company.clone(),
        freelancer: freelancer.clone(),
        doc_type,
        storage_key: format!("uploads/{}/{}", freelancer, file),
    }
}

fn application(freelancer: &FreelancerId, company: &CompanyId, id: &str) -> ApplicationRequest {
    ApplicationRequest {
        application: ApplicationRef(id.to_string()),
        freelancer: freelancer.clone(),
        company: company.clone(),
        scope: RequirementScope::default(),
    }
}

fn print_evaluation(evaluation: &DocumentEvaluation) {
    println!(
        "- {} at {} on {}:",
        evaluation.freelancer,
        evaluation.company,
        evaluation.as_of.date_naive()
    );
    for check in &evaluation.checks {
        let origin = match (&check.source_company, check.cross_company) {
            (Some(company), true) => format!(" (approved by {company})"),
            _ => String::new(),
        };
        println!(
            "  - {}: {:?}{}",
            check.doc_type.label(),
            check.classification,
            origin
        );
    }
}

fn print_sweep(day: DateTime<Utc>, report: &SweepReport) {
    println!(
        "- sweep {}: {} notices, {} deliveries, {} expired, {} duplicates skipped, {} failures",
        day.date_naive(),
        report.notices_created,
        report.deliveries,
        report.records_expired,
        report.duplicates_skipped,
        report.failures.len()
    );
}

fn describe_notification(request: &NotificationRequest) -> String {
    let recipient = match &request.recipient {
        Recipient::Company(company) => format!("company {company}"),
        Recipient::Freelancer(freelancer) => format!("freelancer {freelancer}"),
    };
    format!("[{}] {} -> {}", request.kind.tag(), request.title, recipient)
}

fn join_labels(types: &[DocumentType]) -> String {
    types
        .iter()
        .map(|doc_type| doc_type.label())
        .collect::<Vec<_>>()
        .join(", ")
}

fn expiry_label(expires_at: Option<DateTime<Utc>>) -> String {
    expires_at
        .map(|at| at.date_naive().to_string())
        .unwrap_or_else(|| "no expiry".to_string())
}
