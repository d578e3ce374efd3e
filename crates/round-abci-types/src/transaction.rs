use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ledger::{LedgerKind, LedgerRecover};
use crate::payload::Payload;

/// A payload paired with the signature over its serialized form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub payload: Payload,
    pub signature: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Payload, signature: Vec<u8>) -> Self {
        Self { payload, signature }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Transaction must serialize")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EngineError> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Internal(format!("transaction decode: {e}")))
    }

    /// Recover the signer set from `serde_json(payload)` + `signature`
    /// via the ledger collaborator, and reject unless `payload.sender`
    /// is among them.
    pub fn verify(
        &self,
        ledger_kind: &LedgerKind,
        recover: &dyn LedgerRecover,
    ) -> Result<(), EngineError> {
        let message = serde_json::to_vec(&self.payload)
            .expect("Payload must serialize for signature verification");
        let addresses = recover.recover_message(ledger_kind, &message, &self.signature);
        if addresses.contains(&self.payload.sender) {
            Ok(())
        } else {
            Err(EngineError::SignatureInvalid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FixedRecover(HashSet<String>);

    impl LedgerRecover for FixedRecover {
        fn recover_message(&self, _: &LedgerKind, _: &[u8], _: &[u8]) -> HashSet<String> {
            self.0.clone()
        }
    }

    fn payload(sender: &str) -> Payload {
        Payload {
            tx_kind: "t".into(),
            id: "id".into(),
            sender: sender.into(),
            round_count: -1,
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn accepts_when_sender_is_recovered() {
        let mut recovered = HashSet::new();
        recovered.insert("0xAlice".to_string());
        let tx = Transaction::new(payload("0xAlice"), vec![1, 2, 3]);
        assert!(tx.verify(&LedgerKind::Ethereum, &FixedRecover(recovered)).is_ok());
    }

    #[test]
    fn rejects_when_sender_is_not_recovered() {
        let mut recovered = HashSet::new();
        recovered.insert("0xMallory".to_string());
        let tx = Transaction::new(payload("0xAlice"), vec![1, 2, 3]);
        let err = tx.verify(&LedgerKind::Ethereum, &FixedRecover(recovered)).unwrap_err();
        assert_eq!(err, EngineError::SignatureInvalid);
    }
}
