//! Fund movement saga properties: balance conservation, compensation
//! completeness, and the hold/record/execute failure matrix.

mod common;

use common::*;

use kwachaflow::corebank::LedgerTransferType;
use kwachaflow::error::EngineError;
use kwachaflow::funds::{
    BillPaymentRequest, DirectTransferRequest, FundFlow, TransactionStatus, TransactionStore,
};
use kwachaflow::provider::MockProvider;
use kwachaflow::session::ContextMap;
use std::sync::Arc;
use std::time::Duration;

fn bill_request(amount: &str) -> BillPaymentRequest {
    BillPaymentRequest {
        user_account: USER_ACCOUNT.to_string(),
        biller: "water-board".to_string(),
        account_number: "MTR-9".to_string(),
        amount: dec(amount),
        currency: "MWK".to_string(),
        metadata: ContextMap::new(),
        execution_id: None,
    }
}

fn direct_request(amount: &str, to: &str) -> DirectTransferRequest {
    DirectTransferRequest {
        from_account: USER_ACCOUNT.to_string(),
        to_account: to.to_string(),
        amount: dec(amount),
        currency: "MWK".to_string(),
        description: "wallet transfer".to_string(),
        execution_id: None,
        max_retries: None,
    }
}

#[tokio::test]
async fn bill_payment_settles_and_conserves_balances() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));

    let tx = h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.flow, FundFlow::Reservation);
    assert!(tx.external_reference.is_some());

    // User debited exactly once; held funds sit in suspense pending
    // provider-side settlement.
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("5000"));
    assert_eq!(h.bank.balance(SUSPENSE), dec("5000"));

    // Paired audit record completed under the same reference
    let audit = h.transactions.get_biller(&tx.reference).await.unwrap().unwrap();
    assert_eq!(audit.status, TransactionStatus::Completed);
    assert_eq!(audit.external_reference, tx.external_reference);

    // Pending -> Processing -> Completed
    let history = h.transactions.history(&tx.reference).await.unwrap();
    let statuses: Vec<_> = history.iter().map(|t| t.to_status).collect();
    assert_eq!(
        statuses,
        vec![TransactionStatus::Processing, TransactionStatus::Completed]
    );
}

#[tokio::test]
async fn provider_failure_reverses_hold_and_reports_refund() {
    // Scenario: external payment of 5,000 MWK fails at the provider step.
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.provider.fail_next("Provider rejected payment", Some(422));

    let tx = h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    let message = tx.error_message.as_deref().unwrap();
    assert!(message.contains("Provider rejected payment"));
    assert!(message.contains("Refund status: Success"));

    // Exactly one compensating reversal of 5,000 MWK back to the user
    let reversals = h.bank.count_transfers(|i| {
        i.transfer_type == LedgerTransferType::Reversal
            && i.to_account == USER_ACCOUNT
            && i.amount == dec("5000")
    });
    assert_eq!(reversals, 1);
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("10000"));
    assert_eq!(h.bank.balance(SUSPENSE), dec("0"));

    // Audit record reflects the landed refund
    let audit = h.transactions.get_biller(&tx.reference).await.unwrap().unwrap();
    assert_eq!(audit.status, TransactionStatus::Reversed);

    // Failed reservation transactions are terminal for the sweep
    assert!(tx.next_retry_at.is_none());
    assert!(!h
        .transactions
        .claim_for_retry(&tx.reference, chrono::Utc::now())
        .await
        .unwrap());
}

#[tokio::test]
async fn provider_timeout_is_a_failure_requiring_compensation() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    // Harness provider timeout is 100ms
    h.provider.respond_after(Duration::from_millis(400));

    let tx = h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert!(tx.error_message.as_deref().unwrap().contains("Refund status: Success"));
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("10000"));
    assert_eq!(h.bank.balance(SUSPENSE), dec("0"));
}

#[tokio::test]
async fn record_failure_after_hold_mandates_reversal() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.transactions.fail_next_insert();

    let err = h.coordinator.pay_biller(bill_request("5000")).await.unwrap_err();

    match &err {
        EngineError::Consistency(message) => {
            assert!(message.contains("Refund status: Success"));
        }
        other => panic!("expected consistency error, got {:?}", other),
    }

    // Money came back; nothing stranded, no provider call ever made
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("10000"));
    assert_eq!(h.bank.balance(SUSPENSE), dec("0"));
    assert_eq!(h.provider.request_count(), 0);
}

#[tokio::test]
async fn reversal_failure_is_surfaced_not_swallowed() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.provider.fail_next("Provider rejected payment", Some(500));
    // The reversal credits the user account; make that leg fail
    h.bank.fail_credits_to(USER_ACCOUNT, "LEDGER_LOCKED");

    let tx = h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    let message = tx.error_message.as_deref().unwrap();
    assert!(message.contains("Refund status: Failed"));

    // Stranded funds stay visible in suspense for manual reconciliation
    assert_eq!(h.bank.balance(SUSPENSE), dec("5000"));
    let audit = h.transactions.get_biller(&tx.reference).await.unwrap().unwrap();
    assert_eq!(audit.status, TransactionStatus::Failed);
}

#[tokio::test]
async fn hold_failure_aborts_with_no_record_and_no_provider_call() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.bank.fail_credits_to(SUSPENSE, "GW_DOWN");

    let err = h.coordinator.pay_biller(bill_request("5000")).await.unwrap_err();
    assert!(matches!(err, EngineError::ExternalService(_)));
    assert!(err.to_string().contains("hold failed"));

    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("10000"));
    assert_eq!(h.provider.request_count(), 0);
    // Only the failed hold attempt is in the journal: no reversal needed
    assert_eq!(
        h.bank
            .count_transfers(|i| i.transfer_type == LedgerTransferType::Reversal),
        0
    );
}

#[tokio::test]
async fn insufficient_funds_cannot_start_a_reservation() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("1000"));

    let err = h.coordinator.pay_biller(bill_request("5000")).await.unwrap_err();
    assert!(matches!(err, EngineError::ExternalService(_)));
    assert_eq!(h.provider.request_count(), 0);
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("1000"));
}

#[tokio::test]
async fn unknown_biller_is_rejected_before_any_side_effect() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));

    let mut req = bill_request("5000");
    req.biller = "electricity".to_string();
    let err = h.coordinator.pay_biller(req).await.unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.bank.journal().is_empty());
}

#[tokio::test]
async fn duplicate_hold_reference_is_a_noop_not_a_double_spend() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));

    // A terminal record already exists under the reference the gateway
    // will assign to the next hold.
    let mut existing = kwachaflow::funds::FinancialTransaction::pending(
        "CBS-0000001",
        FundFlow::Reservation,
        dec("5000"),
        "MWK",
        USER_ACCOUNT,
        "MTR-9",
        0,
        "water-board payment for MTR-9",
    );
    existing.status = TransactionStatus::Completed;
    h.transactions.insert(&existing).await.unwrap();

    let tx = h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    assert_eq!(tx.reference, "CBS-0000001");
    assert_eq!(tx.status, TransactionStatus::Completed);
    // The provider leg never re-fires for an already-settled reference
    assert_eq!(h.provider.request_count(), 0);
}

#[tokio::test]
async fn debit_override_passes_suspense_account_to_provider() {
    let provider = Arc::new(MockProvider::new("water-board").with_debit_override());
    let h = Harness::with_provider(provider);
    h.bank.credit(USER_ACCOUNT, dec("10000"));

    h.coordinator.pay_biller(bill_request("5000")).await.unwrap();

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].debit_account.as_deref(), Some(SUSPENSE));
}

#[tokio::test]
async fn direct_transfer_settles_under_gateway_reference() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));

    let tx = h
        .coordinator
        .transfer_direct(direct_request("4000", "2002"))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Completed);
    assert_eq!(tx.flow, FundFlow::Direct);
    assert!(tx.reference.starts_with("CBS-"));
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("6000"));
    assert_eq!(h.bank.balance("2002"), dec("4000"));
}

#[tokio::test]
async fn failed_direct_transfer_is_recorded_retry_eligible() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.bank.fail_credits_to("2002", "GW_DOWN");

    let tx = h
        .coordinator
        .transfer_direct(direct_request("4000", "2002"))
        .await
        .unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.error_code.as_deref(), Some("GW_DOWN"));
    assert_eq!(tx.retry_count, 0);
    assert_eq!(tx.max_retries, 3);

    // First backoff deadline is one base interval out
    let delay = tx.next_retry_at.unwrap() - chrono::Utc::now();
    assert!(delay > chrono::Duration::seconds(100));
    assert!(delay < chrono::Duration::seconds(140));

    // No funds moved
    assert_eq!(h.bank.balance(USER_ACCOUNT), dec("10000"));
}

#[tokio::test]
async fn per_request_retry_override_beats_the_configured_ceiling() {
    let h = Harness::new();
    h.bank.credit(USER_ACCOUNT, dec("10000"));
    h.bank.fail_credits_to("2002", "GW_DOWN");

    let mut req = direct_request("4000", "2002");
    req.max_retries = Some(5);
    let tx = h.coordinator.transfer_direct(req).await.unwrap();

    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.max_retries, 5);
}

#[tokio::test]
async fn direct_transfer_validation_rejects_bad_requests() {
    let h = Harness::new();

    let mut req = direct_request("0", "2002");
    req.amount = dec("0.00");
    assert!(matches!(
        h.coordinator.transfer_direct(req).await.unwrap_err(),
        EngineError::Validation(_)
    ));

    let req = direct_request("10", USER_ACCOUNT);
    assert!(matches!(
        h.coordinator.transfer_direct(req).await.unwrap_err(),
        EngineError::Validation(_)
    ));
    assert!(h.bank.journal().is_empty());
}
