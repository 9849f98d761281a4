//! In-process simulation of two group bills.
//!
//! - a forwarding wallet: friends chip in concurrently, the pooled funds are
//!   sent to the merchant exactly once, then the wallet is closed
//! - a self-settling wallet: the same contributions, funds stay in custody
//!
//! Configuration comes from `SPLITVAULT_*` environment variables. Set
//! `SPLITVAULT_WEBHOOK_URL` to receive settlement webhooks and
//! `SPLITVAULT_LOG_JSON=1` for JSON logs.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rust_decimal::Decimal;
use splitvault_custody::{
    CreateWallet, CustodialAccount, KeyVault, MasterKey, RiskGate, TtlSecretCache,
    WalletLifecycle, WalletStore, store,
};
use splitvault_settlement::{
    FundDispatcher, SettlementEngine, TransferClient, TransferError, TransferRequest,
    WebhookNotifier,
};
use splitvault_types::{
    DeliveryStatus, Participant, ParticipantStatus, SharingMode, SplitvaultConfig, UserId,
    WalletId,
};

/// Stand-in for the chain client: accepts every transfer.
#[derive(Default)]
struct SimulatedChain {
    submitted: AtomicU64,
}

#[async_trait]
impl TransferClient for SimulatedChain {
    async fn transfer(
        &self,
        request: &TransferRequest,
    ) -> std::result::Result<String, TransferError> {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let n = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            from = %request.source,
            to = %request.destination,
            amount = %request.amount,
            memo = %request.memo,
            "Simulated transfer submitted"
        );
        Ok(format!("simtx-{n:06}"))
    }
}

struct Bill<'a> {
    reference: &'a str,
    payee: Option<String>,
    order: Option<&'a str>,
    total: Decimal,
    friends: &'a [&'a str],
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var_os("SPLITVAULT_LOG_JSON").is_some() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn master_key() -> Result<MasterKey> {
    match std::env::var("SPLITVAULT_MASTER_KEY") {
        Ok(encoded) => Ok(MasterKey::from_hex(&encoded)?),
        Err(_) => {
            tracing::warn!("SPLITVAULT_MASTER_KEY not set, using an ephemeral master key");
            Ok(MasterKey::generate())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = SplitvaultConfig::from_env().context("load configuration")?;
    config.validate().context("validate configuration")?;

    let store = store::memory();
    let vault = Arc::new(KeyVault::new(
        master_key()?,
        Arc::new(TtlSecretCache::new(config.vault.secret_cache_ttl())),
        &config.vault,
    ));
    let chain = Arc::new(SimulatedChain::default());

    let mut engine = SettlementEngine::new(
        store.clone(),
        vault.clone(),
        Arc::new(RiskGate::new(config.risk.clone())),
        Arc::new(FundDispatcher::new(chain.clone())),
        config.settlement.clone(),
    );
    let webhook = WebhookNotifier::from_config(&config.webhook);
    let notifying = webhook.is_some();
    if let Some(notifier) = webhook {
        engine = engine.with_notifier(Arc::new(notifier));
    }
    let engine = Arc::new(engine);
    let lifecycle = WalletLifecycle::new(store.clone(), vault, config.settlement.clone());

    let merchant = CustodialAccount::generate().address.to_string();
    let forwarding = run_bill(
        &engine,
        &lifecycle,
        store.as_ref(),
        Bill {
            reference: "dinner-table-12",
            payee: Some(merchant),
            order: Some("order-4471"),
            total: Decimal::new(12_000, 2),
            friends: &["Bob", "Carol", "Dave"],
        },
    )
    .await?;
    let retained = run_bill(
        &engine,
        &lifecycle,
        store.as_ref(),
        Bill {
            reference: "cabin-weekend",
            payee: None,
            order: None,
            total: Decimal::new(80_000, 2),
            friends: &["Erin", "Frank", "Grace"],
        },
    )
    .await?;

    if notifying {
        let patience = config.webhook.attempt_timeout() * config.webhook.max_attempts
            + config.webhook.backoff_for(config.webhook.max_attempts) * 2;
        for id in [forwarding, retained] {
            let status = wait_for_delivery(store.as_ref(), id, patience).await?;
            tracing::info!(wallet = %id, ?status, "Webhook outcome");
        }
    }

    let closed = lifecycle.close_wallet(forwarding).await?;
    tracing::info!(
        wallet = %forwarding,
        status = %closed.wallet.status,
        transfers = chain.submitted.load(Ordering::SeqCst),
        "Simulation finished"
    );
    Ok(())
}

async fn run_bill(
    engine: &Arc<SettlementEngine>,
    lifecycle: &WalletLifecycle,
    store: &dyn WalletStore,
    bill: Bill<'_>,
) -> Result<WalletId> {
    let creator = UserId::new();
    let record = lifecycle
        .create_wallet(
            CreateWallet {
                bill_reference: bill.reference.to_string(),
                creator,
                creator_name: "Alice".to_string(),
                sharing_mode: SharingMode::AnyParticipant,
                currency: "USDC".to_string(),
                total_owed: bill.total,
                payee_address: bill.payee,
                external_order_id: bill.order.map(str::to_string),
                threshold_fraction: None,
                participants: Vec::new(),
            },
            CustodialAccount::generate(),
        )
        .await?;
    let id = record.wallet.id;

    let mut members = vec![creator];
    for name in bill.friends {
        let user = UserId::new();
        engine
            .ledger()
            .upsert_participant(
                id,
                Participant::new(user, *name).with_status(ParticipantStatus::Accepted),
            )
            .await?;
        members.push(user);
    }

    let wallet = store.load(id).await?.wallet;
    let mut tasks = Vec::with_capacity(members.len());
    for (n, user) in members.into_iter().enumerate() {
        let share = wallet
            .participant(&user)
            .map(|p| p.share_owed)
            .ok_or_else(|| anyhow!("participant {user} missing from wallet {id}"))?;
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .record_contribution_and_settle(id, user, share, &format!("pay-{n}"))
                .await
        }));
    }
    for task in tasks {
        let (receipt, outcome) = task.await??;
        tracing::info!(
            wallet = %id,
            contributed = %receipt.wallet_total,
            ?outcome,
            "Contribution processed"
        );
    }

    let record = store.load(id).await?;
    tracing::info!(
        wallet = %id,
        mode = %record.settlement.mode,
        payment_status = %record.settlement.payment_status,
        reference = ?record.settlement.settlement_reference,
        "Bill settled"
    );
    Ok(id)
}

async fn wait_for_delivery(
    store: &dyn WalletStore,
    id: WalletId,
    patience: Duration,
) -> Result<DeliveryStatus> {
    let deadline = tokio::time::Instant::now() + patience;
    loop {
        let delivery = store.load(id).await?.settlement.delivery;
        if delivery != DeliveryStatus::NotAttempted || tokio::time::Instant::now() >= deadline {
            return Ok(delivery);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
