use crate::{
    abi,
    config::{PollPolicy, SubmitPolicy},
    contract::OracleContract,
    error::OracleError,
    model::{InferenceTicket, ModelSelector, Receipt, ReceiptStatus, RequestId},
    receipt::{ReceiptSource, RequestIdLayout},
};
use alloy_primitives::B256;
use std::sync::Arc;
use tokio::sync::watch;

/// Result of a single read of a request record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The oracle has written its output.
    Ready(String),
    /// The output is still empty; the off-chain computation is running.
    NotReady,
}

/// Aborts polling on the paired [`CancelSignal`].
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    /// Fires the signal. Calling it again has no further effect.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Observed by polling loops; every clone sees the same cancellation.
#[derive(Clone, Debug)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    /// Whether [`CancelHandle::cancel`] was already called.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Pends forever if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        let closed = self.0.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a connected handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Client for the submit-then-poll inference protocol.
pub struct OracleClient {
    contract: Arc<dyn OracleContract>,
    receipts: Arc<dyn ReceiptSource>,
    submit_policy: SubmitPolicy,
    poll_policy: PollPolicy,
    models: ModelSelector,
    layout: RequestIdLayout,
}

impl OracleClient {
    /// Builds a client with the default poll policy, models and
    /// [`RequestIdLayout::V1`]. The mining bound comes from `submit_policy`.
    pub fn new(
        contract: Arc<dyn OracleContract>,
        receipts: Arc<dyn ReceiptSource>,
        submit_policy: SubmitPolicy,
    ) -> Self {
        Self {
            contract,
            receipts,
            submit_policy,
            poll_policy: PollPolicy::default(),
            models: ModelSelector::default(),
            layout: RequestIdLayout::V1,
        }
    }

    /// Replaces the policy used by [`ask`](Self::ask).
    pub fn with_poll_policy(mut self, poll_policy: PollPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    /// Replaces the model pair used by [`ask`](Self::ask).
    pub fn with_models(mut self, models: ModelSelector) -> Self {
        self.models = models;
        self
    }

    /// Reads request ids from another log or topic position.
    pub fn with_layout(mut self, layout: RequestIdLayout) -> Self {
        self.layout = layout;
        self
    }

    /// The policy [`ask`](Self::ask) polls with.
    pub fn poll_policy(&self) -> PollPolicy {
        self.poll_policy
    }

    /// The model pair [`ask`](Self::ask) submits with.
    pub fn models(&self) -> ModelSelector {
        self.models
    }

    /// Submits a prompt and returns once the transaction is mined.
    ///
    /// Failures after the broadcast carry the transaction hash; see
    /// [`OracleError::tx_hash`].
    pub async fn submit(
        &self,
        first_model: u64,
        second_model: u64,
        prompt: &str,
    ) -> Result<B256, OracleError> {
        let receipt = self
            .submit_and_mine(ModelSelector::new(first_model, second_model), prompt)
            .await?;
        Ok(receipt.transaction_hash)
    }

    /// Fetches the receipt of `tx_hash` and reads the request id from it.
    pub async fn extract_request_id(&self, tx_hash: B256) -> Result<RequestId, OracleError> {
        let receipt = self.wait_mined(tx_hash).await?;
        self.layout.extract(&receipt)
    }

    /// Reads the request record once.
    pub async fn fetch_result(&self, request_id: RequestId) -> Result<FetchOutcome, OracleError> {
        let record = self.contract.read_request(request_id).await?;
        if !record.exists() {
            return Err(OracleError::Read(format!("request {request_id} not found")));
        }
        if !record.is_resolved() {
            return Ok(FetchOutcome::NotReady);
        }
        abi::decode_output(&record.output)
            .map(FetchOutcome::Ready)
            .map_err(|error| OracleError::Read(format!("request {request_id}: {error}")))
    }

    /// Polls without a way to cancel.
    pub async fn poll_for_result(
        &self,
        request_id: RequestId,
        policy: PollPolicy,
    ) -> Result<String, OracleError> {
        self.poll_for_result_until(request_id, policy, CancelSignal::never())
            .await
    }

    /// Retries [`fetch_result`](Self::fetch_result) until the output is
    /// written, the attempts run out, or `cancel` fires.
    pub async fn poll_for_result_until(
        &self,
        request_id: RequestId,
        policy: PollPolicy,
        mut cancel: CancelSignal,
    ) -> Result<String, OracleError> {
        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(OracleError::Cancelled(request_id));
            }
            match self.fetch_result(request_id).await? {
                FetchOutcome::Ready(text) => {
                    log::info!("request {request_id} resolved after {attempt} attempt(s)");
                    return Ok(text);
                }
                FetchOutcome::NotReady if attempt < policy.max_attempts => {
                    log::debug!(
                        "request {request_id} not ready, retrying in {:?} (attempt {attempt}/{})",
                        policy.interval(),
                        policy.max_attempts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(policy.interval()) => {}
                        _ = cancel.cancelled() => return Err(OracleError::Cancelled(request_id)),
                    }
                }
                FetchOutcome::NotReady => {}
            }
        }
        log::warn!(
            "request {request_id} still pending after {} attempts",
            policy.max_attempts
        );
        Err(OracleError::Timeout {
            request_id,
            attempts: policy.max_attempts,
        })
    }

    /// Submits `prompt` and returns the ticket to poll with.
    pub async fn start(
        &self,
        selector: ModelSelector,
        prompt: &str,
    ) -> Result<InferenceTicket, OracleError> {
        let receipt = self.submit_and_mine(selector, prompt).await?;
        let request_id = self.layout.extract(&receipt)?;
        log::info!(
            "transaction {} mined with request id {request_id}",
            receipt.transaction_hash
        );
        Ok(InferenceTicket {
            tx_hash: receipt.transaction_hash,
            request_id,
        })
    }

    /// Submits `prompt` with the configured models and waits for the answer.
    pub async fn ask(&self, prompt: &str) -> Result<String, OracleError> {
        self.ask_with(self.models, prompt, CancelSignal::never())
            .await
    }

    /// Like [`ask`](Self::ask), with explicit models and a cancellation
    /// signal that stops the polling.
    pub async fn ask_with(
        &self,
        selector: ModelSelector,
        prompt: &str,
        cancel: CancelSignal,
    ) -> Result<String, OracleError> {
        let ticket = self.start(selector, prompt).await?;
        self.poll_for_result_until(ticket.request_id, self.poll_policy, cancel)
            .await
    }

    async fn submit_and_mine(
        &self,
        selector: ModelSelector,
        prompt: &str,
    ) -> Result<Receipt, OracleError> {
        if prompt.trim().is_empty() {
            return Err(OracleError::Submission("prompt cannot be empty".to_string()));
        }
        let tx_hash = self.contract.submit_inference(selector, prompt).await?;
        let receipt = self.wait_mined(tx_hash).await?;
        if receipt.status() == ReceiptStatus::Reverted {
            return Err(OracleError::Submission(format!(
                "transaction {tx_hash} reverted"
            )));
        }
        Ok(receipt)
    }

    async fn wait_mined(&self, tx_hash: B256) -> Result<Receipt, OracleError> {
        let timeout = self.submit_policy.mining_timeout;
        tokio::time::timeout(timeout, self.receipts.wait_for_receipt(tx_hash))
            .await
            .map_err(|_| OracleError::MiningTimeout { tx_hash, timeout })?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{InferenceRecord, Log};
    use alloy_primitives::{Address, Bytes, U256};
    use async_trait::async_trait;
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    pub(crate) const REQUEST_ID: u64 = 42;

    /// Serves scripted outputs; the last entry repeats once the script runs out.
    pub(crate) struct ScriptedContract {
        outputs: Vec<Option<&'static str>>,
        pub(crate) reads: AtomicUsize,
        pub(crate) submissions: Mutex<Vec<(ModelSelector, String)>>,
        submit_error: Option<&'static str>,
    }

    impl ScriptedContract {
        pub(crate) fn new(outputs: Vec<Option<&'static str>>) -> Self {
            Self {
                outputs,
                reads: AtomicUsize::new(0),
                submissions: Mutex::new(Vec::new()),
                submit_error: None,
            }
        }

        fn rejecting(reason: &'static str) -> Self {
            Self {
                submit_error: Some(reason),
                ..Self::new(vec![None])
            }
        }

        pub(crate) fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OracleContract for ScriptedContract {
        async fn submit_inference(
            &self,
            selector: ModelSelector,
            prompt: &str,
        ) -> Result<B256, OracleError> {
            if let Some(reason) = self.submit_error {
                return Err(OracleError::Submission(reason.to_string()));
            }
            self.submissions
                .lock()
                .unwrap()
                .push((selector, prompt.to_string()));
            Ok(B256::repeat_byte(0xab))
        }

        async fn read_request(&self, request_id: RequestId) -> Result<InferenceRecord, OracleError> {
            assert_eq!(request_id, RequestId::from(REQUEST_ID));
            let index = self.reads.fetch_add(1, Ordering::SeqCst);
            let output = self.outputs[index.min(self.outputs.len() - 1)];
            Ok(InferenceRecord {
                sender: Address::repeat_byte(0x11),
                model_id: U256::from(11u64),
                input: Bytes::from_static(b"prompt"),
                output: output
                    .map(|text| Bytes::from(abi::encode_output(text)))
                    .unwrap_or_default(),
            })
        }
    }

    pub(crate) struct FixedReceipts {
        receipt: Option<Receipt>,
    }

    impl FixedReceipts {
        pub(crate) fn mined(status: &str, logs: Vec<Log>) -> Self {
            Self {
                receipt: Some(Receipt {
                    transaction_hash: B256::repeat_byte(0xab),
                    status: Some(status.to_string()),
                    block_number: Some("0x10".to_string()),
                    logs,
                }),
            }
        }

        pub(crate) fn with_request_id() -> Self {
            Self::mined("0x1", vec![request_log(REQUEST_ID)])
        }

        fn never_mined() -> Self {
            Self { receipt: None }
        }
    }

    #[async_trait]
    impl ReceiptSource for FixedReceipts {
        async fn wait_for_receipt(&self, _tx_hash: B256) -> Result<Receipt, OracleError> {
            match &self.receipt {
                Some(receipt) => Ok(receipt.clone()),
                None => std::future::pending().await,
            }
        }
    }

    pub(crate) fn request_log(id: u64) -> Log {
        Log {
            topics: vec![
                format!("0x{}", "5c".repeat(32)),
                format!("0x{id:064x}"),
            ],
            ..Log::default()
        }
    }

    pub(crate) fn client(contract: Arc<ScriptedContract>, receipts: FixedReceipts) -> OracleClient {
        OracleClient::new(
            contract,
            Arc::new(receipts),
            SubmitPolicy::new(Duration::from_secs(60)),
        )
        .with_poll_policy(PollPolicy::new(3, Duration::ZERO))
    }

    #[tokio::test]
    async fn poll_resolves_on_third_attempt() {
        let contract = Arc::new(ScriptedContract::new(vec![None, None, Some("plan A")]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());

        let text = client
            .poll_for_result(RequestId::from(REQUEST_ID), PollPolicy::new(3, Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(text, "plan A");
        assert_eq!(contract.reads(), 3);
    }

    #[tokio::test]
    async fn poll_times_out_after_exact_attempts() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());

        let error = client
            .poll_for_result(RequestId::from(REQUEST_ID), PollPolicy::new(2, Duration::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(error, OracleError::Timeout { attempts: 2, .. }));
        assert_eq!(contract.reads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_never_exceeds_its_budget() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());
        let policy = PollPolicy::new(4, Duration::from_secs(15));

        let started = tokio::time::Instant::now();
        let result = client
            .poll_for_result(RequestId::from(REQUEST_ID), policy)
            .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed <= policy.budget());
        assert!(elapsed >= Duration::from_secs(45));
        assert_eq!(contract.reads(), 4);
    }

    #[tokio::test]
    async fn fetch_is_idempotent_before_and_after_resolution() {
        let contract = Arc::new(ScriptedContract::new(vec![
            None,
            None,
            Some("résumé ✅"),
        ]));
        let client = client(contract, FixedReceipts::with_request_id());
        let id = RequestId::from(REQUEST_ID);

        assert_eq!(client.fetch_result(id).await.unwrap(), FetchOutcome::NotReady);
        assert_eq!(client.fetch_result(id).await.unwrap(), FetchOutcome::NotReady);
        for _ in 0..3 {
            assert_eq!(
                client.fetch_result(id).await.unwrap(),
                FetchOutcome::Ready("résumé ✅".to_string())
            );
        }
    }

    #[tokio::test]
    async fn ask_runs_the_whole_cycle() {
        let contract = Arc::new(ScriptedContract::new(vec![None, Some("fix the gate")]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());

        assert_eq!(client.ask("what needs repair?").await.unwrap(), "fix the gate");
        assert_eq!(
            *contract.submissions.lock().unwrap(),
            vec![(ModelSelector::new(11, 50), "what needs repair?".to_string())]
        );
    }

    #[tokio::test]
    async fn submit_and_extract_return_hash_and_id() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract, FixedReceipts::with_request_id());

        let tx_hash = client.submit(1, 2, "hello").await.unwrap();
        assert_eq!(tx_hash, B256::repeat_byte(0xab));
        assert_eq!(
            client.extract_request_id(tx_hash).await.unwrap(),
            RequestId::from(REQUEST_ID)
        );
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected_before_submission() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());

        let error = client.submit(11, 50, "   ").await.unwrap_err();
        assert!(matches!(error, OracleError::Submission(_)));
        assert!(contract.submissions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_submission_is_not_retried() {
        let contract = Arc::new(ScriptedContract::rejecting("insufficient funds"));
        let client = client(contract.clone(), FixedReceipts::with_request_id());

        let error = client.ask("hello").await.unwrap_err();
        assert!(matches!(error, OracleError::Submission(reason) if reason == "insufficient funds"));
        assert_eq!(contract.reads(), 0);
    }

    #[tokio::test]
    async fn reverted_receipt_is_a_submission_error() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(
            contract,
            FixedReceipts::mined("reverted", vec![request_log(REQUEST_ID)]),
        );

        assert!(matches!(
            client.submit(11, 50, "hello").await,
            Err(OracleError::Submission(_))
        ));
    }

    #[tokio::test]
    async fn receipt_without_logs_is_malformed() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::mined("0x1", Vec::new()));

        assert!(matches!(
            client.extract_request_id(B256::repeat_byte(0xab)).await,
            Err(OracleError::MalformedReceipt { .. })
        ));
        assert!(matches!(
            client.ask("hello").await,
            Err(OracleError::MalformedReceipt { .. })
        ));
        assert_eq!(contract.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mining_wait_is_bounded() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract, FixedReceipts::never_mined());

        let error = client.submit(11, 50, "hello").await.unwrap_err();
        assert!(matches!(
            error,
            OracleError::MiningTimeout { timeout, .. } if timeout == Duration::from_secs(60)
        ));
        assert!(error.is_recoverable());
    }

    #[tokio::test]
    async fn cancelled_before_polling_reads_nothing() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let error = client
            .poll_for_result_until(RequestId::from(REQUEST_ID), PollPolicy::default(), signal)
            .await
            .unwrap_err();
        assert!(matches!(error, OracleError::Cancelled(_)));
        assert_eq!(contract.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_the_sleep() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract.clone(), FixedReceipts::with_request_id());
        let (handle, signal) = cancel_pair();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            handle.cancel();
        });

        let started = tokio::time::Instant::now();
        let error = client
            .poll_for_result_until(
                RequestId::from(REQUEST_ID),
                PollPolicy::new(10, Duration::from_secs(15)),
                signal,
            )
            .await
            .unwrap_err();

        assert!(matches!(error, OracleError::Cancelled(_)));
        assert_eq!(contract.reads(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unknown_request_is_a_read_error() {
        struct EmptyContract;

        #[async_trait]
        impl OracleContract for EmptyContract {
            async fn submit_inference(
                &self,
                _selector: ModelSelector,
                _prompt: &str,
            ) -> Result<B256, OracleError> {
                Ok(B256::ZERO)
            }

            async fn read_request(
                &self,
                _request_id: RequestId,
            ) -> Result<InferenceRecord, OracleError> {
                Ok(InferenceRecord::default())
            }
        }

        let client = OracleClient::new(
            Arc::new(EmptyContract),
            Arc::new(FixedReceipts::with_request_id()),
            SubmitPolicy::new(Duration::from_secs(1)),
        );
        let error = client
            .poll_for_result(RequestId::from(7), PollPolicy::new(5, Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(error, OracleError::Read(_)));
    }

    #[tokio::test]
    async fn corrupt_output_is_a_read_error() {
        struct CorruptContract;

        #[async_trait]
        impl OracleContract for CorruptContract {
            async fn submit_inference(
                &self,
                _selector: ModelSelector,
                _prompt: &str,
            ) -> Result<B256, OracleError> {
                Ok(B256::ZERO)
            }

            async fn read_request(
                &self,
                _request_id: RequestId,
            ) -> Result<InferenceRecord, OracleError> {
                // a string of length 2 whose payload is `ff fe`
                let mut output = vec![0u8; 96];
                output[31] = 0x20;
                output[63] = 2;
                output[64] = 0xff;
                output[65] = 0xfe;
                Ok(InferenceRecord {
                    sender: Address::repeat_byte(0x11),
                    model_id: U256::from(11u64),
                    input: Bytes::from_static(b"prompt"),
                    output: Bytes::from(output),
                })
            }
        }

        let client = OracleClient::new(
            Arc::new(CorruptContract),
            Arc::new(FixedReceipts::with_request_id()),
            SubmitPolicy::new(Duration::from_secs(1)),
        );
        let id = RequestId::from(REQUEST_ID);

        assert!(matches!(
            client.fetch_result(id).await,
            Err(OracleError::Read(reason)) if reason.contains("UTF-8")
        ));
        assert!(matches!(
            client.poll_for_result(id, PollPolicy::new(3, Duration::ZERO)).await,
            Err(OracleError::Read(_))
        ));
    }

    #[tokio::test]
    async fn unavailable_receipt_keeps_the_hash() {
        struct UnavailableReceipts;

        #[async_trait]
        impl ReceiptSource for UnavailableReceipts {
            async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, OracleError> {
                Err(OracleError::Receipt {
                    tx_hash,
                    reason: "receipt proxy returned status 502 Bad Gateway".to_string(),
                })
            }
        }

        let contract = Arc::new(ScriptedContract::new(vec![Some("unused")]));
        let client = OracleClient::new(
            contract.clone(),
            Arc::new(UnavailableReceipts),
            SubmitPolicy::new(Duration::from_secs(60)),
        );

        let error = client.ask("hello").await.unwrap_err();
        assert!(matches!(error, OracleError::Receipt { .. }));
        assert_eq!(error.tx_hash(), Some(B256::repeat_byte(0xab)));
        assert!(error.is_recoverable());
        assert_eq!(contract.submissions.lock().unwrap().len(), 1);
        assert_eq!(contract.reads(), 0);
    }

    #[tokio::test]
    async fn malformed_receipt_keeps_the_hash() {
        let contract = Arc::new(ScriptedContract::new(vec![None]));
        let client = client(contract, FixedReceipts::mined("0x1", Vec::new()));

        let error = client
            .start(ModelSelector::default(), "hello")
            .await
            .unwrap_err();
        assert_eq!(error.tx_hash(), Some(B256::repeat_byte(0xab)));
    }
}
