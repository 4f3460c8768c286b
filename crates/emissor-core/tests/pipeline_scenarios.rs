//! End-to-end pipeline scenarios over in-memory adapters and a scripted
//! authority transport. The real SEFAZ is never contacted.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use emissor_core::archive::Archiver;
use emissor_core::fiscal::validator::StructuralValidator;
use emissor_core::fiscal::{access_key, signer};
use emissor_core::intake::{IntakeOutcome, IntakeService};
use emissor_core::machine::RetryPolicy;
use emissor_core::model::{
    replay, Address, CertificateRef, Company, ContingencyKind, ContributorSecret, Environment,
    Item, ItemTaxes, Payment, Request, RequestStatus, SaleIssuer, SalePayload, Uf,
};
use emissor_core::pipeline::{EmissionPipeline, PipelineDeps};
use emissor_core::queue::MemoryQueue;
use emissor_core::sefaz::{SefazClient, SefazError, SoapTransport};
use emissor_core::storage::LocalStorage;
use emissor_core::store::{MemoryStore, RequestStore};
use rust_decimal_macros::dec;
use secrecy::SecretString;
use uuid::Uuid;

/// Transport answering from a script and recording the endpoints it saw.
struct ScriptedAuthority {
    replies: Mutex<Vec<Result<Vec<u8>, SefazError>>>,
    endpoints: Mutex<Vec<String>>,
}

impl ScriptedAuthority {
    fn new(replies: Vec<Result<Vec<u8>, SefazError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies),
            endpoints: Mutex::new(Vec::new()),
        })
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.lock().unwrap().clone()
    }
}

#[async_trait]
impl SoapTransport for ScriptedAuthority {
    async fn post(&self, endpoint: &str, _envelope: &str) -> Result<Vec<u8>, SefazError> {
        self.endpoints.lock().unwrap().push(endpoint.to_string());
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            // Scripts that run dry behave like a dead authority.
            return Err(SefazError::Transport("connection reset".to_string()));
        }
        replies.remove(0)
    }
}

fn authorized_body(protocol: &str) -> Vec<u8> {
    format!(
        "<retEnviNFe><cStat>104</cStat><xMotivo>Lote processado</xMotivo>\
         <protNFe><infProt><nProt>{protocol}</nProt>\
         <cStat>100</cStat><xMotivo>Autorizado o uso da NF-e</xMotivo>\
         </infProt></protNFe></retEnviNFe>"
    )
    .into_bytes()
}

fn status_body(cstat: u16, reason: &str) -> Vec<u8> {
    format!("<retEnviNFe><cStat>{cstat}</cStat><xMotivo>{reason}</xMotivo></retEnviNFe>")
        .into_bytes()
}

/// Self-signed PFX generated per test run.
fn test_certificate(password: &str) -> CertificateRef {
    use openssl::asn1::Asn1Time;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::pkcs12::Pkcs12;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::{X509NameBuilder, X509};

    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "EMISSOR TESTE").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(365).unwrap();
    builder.set_not_before(&not_before).unwrap();
    builder.set_not_after(&not_after).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    let bundle = Pkcs12::builder()
        .name("emissor-test")
        .pkey(&pkey)
        .cert(&certificate)
        .build2(password)
        .unwrap();

    CertificateRef {
        pfx_base64: openssl::base64::encode_block(&bundle.to_der().unwrap()),
        password: SecretString::new(password.to_string()),
    }
}

fn company(uf: Uf) -> Company {
    Company {
        id: Uuid::new_v4(),
        cnpj: "12345678000195".to_string(),
        legal_name: "PAPELARIA MODELO LTDA".to_string(),
        trade_name: Some("PAPELARIA MODELO".to_string()),
        ie: "1234567890".to_string(),
        crt: "1".to_string(),
        address: Address {
            street: "RUA AUGUSTA".to_string(),
            number: "1200".to_string(),
            district: "CONSOLACAO".to_string(),
            municipality_code: uf.capital_municipality().to_string(),
            municipality: "CAPITAL".to_string(),
            uf,
            postal_code: "01304001".to_string(),
            phone: None,
        },
        certificate: test_certificate("segredo"),
        csc: ContributorSecret {
            id: "000001".to_string(),
            token: SecretString::new("CSC-TOKEN".to_string()),
        },
    }
}

fn payload(company: &Company) -> SalePayload {
    SalePayload {
        company_id: company.id,
        uf: company.address.uf,
        environment: Environment::Homologation,
        issuer: SaleIssuer {
            cnpj: company.cnpj.clone(),
            ie: company.ie.clone(),
            crt: company.crt.clone(),
            csc_id: "000001".to_string(),
            csc_token: "CSC-TOKEN".to_string(),
        },
        items: vec![Item {
            description: "CANETA ESFEROGRAFICA".to_string(),
            ncm: "84713019".to_string(),
            cfop: "5102".to_string(),
            gtin: None,
            unit: "UN".to_string(),
            quantity: dec!(1),
            unit_price: dec!(29.90),
            taxes: ItemTaxes::default(),
        }],
        payments: vec![Payment {
            method: "01".to_string(),
            amount: dec!(29.90),
            card: None,
        }],
        series: 1,
        consumer_tax_id: None,
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    transport: Arc<ScriptedAuthority>,
    pipeline: EmissionPipeline,
    intake: IntakeService,
    artifacts_dir: tempfile::TempDir,
    company: Company,
}

fn harness(uf: Uf, replies: Vec<Result<Vec<u8>, SefazError>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let transport = ScriptedAuthority::new(replies);
    let artifacts_dir = tempfile::tempdir().unwrap();

    let company = company(uf);
    store.put_company(company.clone());

    let storage = Arc::new(LocalStorage::new(
        artifacts_dir.path().to_path_buf(),
        "http://files".to_string(),
    ));

    let pipeline = EmissionPipeline::new(PipelineDeps {
        requests: store.clone(),
        companies: store.clone(),
        sequences: store.clone(),
        validator: Arc::new(StructuralValidator),
        sefaz: SefazClient::new(transport.clone()),
        archiver: Archiver::new(storage),
        policy: RetryPolicy::default(),
    });
    let intake = IntakeService::new(store.clone(), queue.clone());

    Harness {
        store,
        queue,
        transport,
        pipeline,
        intake,
        artifacts_dir,
        company,
    }
}

async fn submit(harness: &Harness, key: &str) -> Request {
    let outcome = harness
        .intake
        .submit(key, payload(&harness.company))
        .await
        .unwrap();
    match outcome {
        IntakeOutcome::Accepted(request) => request,
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn happy_path_authorizes_and_archives() {
    let harness = harness(Uf::SP, vec![Ok(authorized_body("135260000000042"))]);

    let request = submit(&harness, "happy-1").await;
    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(harness.queue.emitted().len(), 1);

    harness.pipeline.process(request.id).await.unwrap();

    let stored = harness.store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Authorized);
    assert_eq!(stored.protocol.as_deref(), Some("135260000000042"));
    assert_eq!(stored.document_number, Some(1));
    assert_eq!(stored.series, Some(1));

    let key = stored.access_key.expect("access key");
    assert_eq!(key.len(), 44);
    assert!(access_key::verify(&key));

    // All three artifacts landed under nfce/<company>/...
    for (dir, extension) in [("xml", "xml"), ("pdf", "pdf"), ("qr", "png")] {
        let path = harness
            .artifacts_dir
            .path()
            .join(format!("nfce/{}/{dir}/{key}.{extension}", stored.company_id));
        assert!(path.is_file(), "missing artifact {path:?}");
    }
    assert!(stored.xml_url.is_some());
    assert!(stored.pdf_url.is_some());
    assert!(stored.qr_url.is_some());

    // The archived XML carries a verifiable enveloped signature.
    let xml_path = harness
        .artifacts_dir
        .path()
        .join(format!("nfce/{}/xml/{key}.xml", stored.company_id));
    let signed = std::fs::read(&xml_path).unwrap();
    signer::verify_enveloped(&signed).unwrap();

    // Tampering with one byte of infNFe breaks verification.
    let tampered = String::from_utf8(signed)
        .unwrap()
        .replace("<vNF>29.90</vNF>", "<vNF>29.91</vNF>");
    assert!(signer::verify_enveloped(tampered.as_bytes()).is_err());

    // Event replay reconstructs the final status.
    let events = harness.store.events(request.id).await.unwrap();
    assert_eq!(replay(&events), Some(RequestStatus::Authorized));
}

#[tokio::test]
async fn idempotent_replay_references_the_same_request() {
    let harness = harness(Uf::SP, vec![]);

    let first = submit(&harness, "replay-1").await;
    let second = harness
        .intake
        .submit("replay-1", payload(&harness.company))
        .await
        .unwrap();
    let IntakeOutcome::Existing(existing) = second else {
        panic!("expected replay");
    };
    assert_eq!(existing.id, first.id);
    assert_eq!(harness.queue.emitted().len(), 1);
}

#[tokio::test]
async fn concurrent_submissions_create_exactly_one_request() {
    let harness = harness(Uf::SP, vec![]);
    let intake = Arc::new(IntakeService::new(
        harness.store.clone(),
        harness.queue.clone(),
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let intake = intake.clone();
        let body = payload(&harness.company);
        handles.push(tokio::spawn(async move {
            match intake.submit("race-1", body).await.unwrap() {
                IntakeOutcome::Accepted(request) | IntakeOutcome::Existing(request) => request.id,
                IntakeOutcome::AlreadyRejected(request) => request.id,
            }
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 1, "all submissions must observe one request");
}

#[tokio::test]
async fn business_rejection_is_terminal() {
    let harness = harness(
        Uf::SP,
        vec![Ok(status_body(204, "Duplicidade de NF-e"))],
    );

    let request = submit(&harness, "dup-1").await;
    harness.pipeline.process(request.id).await.unwrap();

    let stored = harness.store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Rejected);
    assert_eq!(stored.rejection_code.as_deref(), Some("204"));
    assert_eq!(stored.rejection_reason.as_deref(), Some("Duplicidade de NF-e"));
    assert!(stored.next_retry_at.is_none());

    // No retry was scheduled.
    let events = harness.store.events(request.id).await.unwrap();
    assert!(events
        .iter()
        .all(|event| event.status_to != RequestStatus::Retrying));
}

#[tokio::test]
async fn contingency_switch_then_success() {
    let harness = harness(
        Uf::SP,
        vec![
            Ok(status_body(108, "Servico Paralisado Momentaneamente")),
            Ok(authorized_body("135260000000099")),
        ],
    );

    let request = submit(&harness, "cont-1").await;
    harness.pipeline.process(request.id).await.unwrap();

    let stored = harness.store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Authorized);
    assert!(stored.in_contingency);
    assert_eq!(stored.contingency_kind, Some(ContingencyKind::SvcAn));
    // The contingency re-run is immediate, not a scheduled retry.
    assert_eq!(stored.retry_count, 0);

    let endpoints = harness.transport.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints[0].contains("fazenda.sp.gov.br"));
    assert!(endpoints[1].contains("svc.fazenda.gov.br"));

    let events = harness.store.events(request.id).await.unwrap();
    assert_eq!(replay(&events), Some(RequestStatus::Authorized));
    assert!(events
        .iter()
        .any(|event| event.status_to == RequestStatus::Contingency));
}

#[tokio::test]
async fn southern_emitter_switches_to_svc_rs() {
    let harness = harness(
        Uf::RS,
        vec![
            Ok(status_body(108, "Servico Paralisado Momentaneamente")),
            Ok(authorized_body("143260000000011")),
        ],
    );

    let request = submit(&harness, "rs-1").await;
    harness.pipeline.process(request.id).await.unwrap();

    let stored = harness.store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.contingency_kind, Some(ContingencyKind::SvcRs));
    let endpoints = harness.transport.endpoints();
    assert!(endpoints[1].contains("svrs.rs.gov.br"));
}

#[tokio::test]
async fn persistent_transport_failure_exhausts_the_budget() {
    // The script is empty: every submission fails at the transport.
    let harness = harness(Uf::SP, vec![]);

    let request = submit(&harness, "down-1").await;

    // Drive the request through every scheduled attempt. The scheduler is
    // exercised separately; here each process call plays one delivery.
    for _ in 0..6 {
        harness.pipeline.process(request.id).await.unwrap();
    }

    let stored = harness.store.get(request.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Rejected);
    assert_eq!(
        stored.rejection_code.as_deref(),
        Some(emissor_core::error::BUDGET_EXHAUSTED_CODE)
    );
    assert_eq!(stored.retry_count, 5);

    let events = harness.store.events(request.id).await.unwrap();
    let retry_events = events
        .iter()
        .filter(|event| event.status_to == RequestStatus::Retrying)
        .count();
    assert_eq!(retry_events, 5);
    assert_eq!(replay(&events), Some(RequestStatus::Rejected));

    // Nothing further happens to a terminal request.
    harness.pipeline.process(request.id).await.unwrap();
    let after = harness.store.events(request.id).await.unwrap();
    assert_eq!(after.len(), events.len());
}

#[tokio::test]
async fn backoff_schedule_follows_the_floors() {
    let harness = harness(Uf::SP, vec![]);
    let request = submit(&harness, "backoff-1").await;

    let expected_delays = [60i64, 300, 900, 3600, 21600];
    for expected in expected_delays {
        let before = Utc::now();
        harness.pipeline.process(request.id).await.unwrap();
        let stored = harness.store.get(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Retrying);

        let next = stored.next_retry_at.expect("deadline scheduled");
        let delta = (next - before).num_seconds();
        assert!(
            (delta - expected).abs() <= 5,
            "retry {expected}s floor violated: got {delta}s"
        );
    }
}

#[tokio::test]
async fn document_numbers_are_strictly_monotonic_per_company() {
    let harness = harness(
        Uf::SP,
        vec![
            Ok(authorized_body("1")),
            Ok(authorized_body("2")),
            Ok(authorized_body("3")),
        ],
    );

    let mut numbers = Vec::new();
    for key in ["seq-1", "seq-2", "seq-3"] {
        let request = submit(&harness, key).await;
        harness.pipeline.process(request.id).await.unwrap();
        let stored = harness.store.get(request.id).await.unwrap().unwrap();
        numbers.push(stored.document_number.unwrap());
    }
    assert_eq!(numbers, vec![1, 2, 3]);
}
