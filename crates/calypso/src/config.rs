//! Configuration options for card transactions

use serde::{Deserialize, Serialize};

/// Policy settings of a card transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransactionSettings {
    /// On session buffer overflow, close the session and open a new one
    ///
    /// Never applied to DEBIT sessions nor while an SV operation awaits its check.
    pub multiple_session_enabled: bool,

    /// Allow SV debits to drive the balance below zero
    pub allow_negative_balance: bool,

    /// Lowest balance reachable when negative balances are allowed
    pub negative_balance_limit: i32,

    /// Ask the card for a ratification when closing the session
    pub ratification_requested: bool,
}

impl TransactionSettings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable session splitting on buffer overflow
    pub const fn with_multiple_session(mut self, enabled: bool) -> Self {
        self.multiple_session_enabled = enabled;
        self
    }

    /// Allow or forbid negative balances
    pub const fn with_allow_negative_balance(mut self, allow: bool) -> Self {
        self.allow_negative_balance = allow;
        self
    }

    /// Set the lowest reachable balance
    pub const fn with_negative_balance_limit(mut self, limit: i32) -> Self {
        self.negative_balance_limit = limit;
        self
    }

    /// Ask or not for ratification at session close
    pub const fn with_ratification_requested(mut self, requested: bool) -> Self {
        self.ratification_requested = requested;
        self
    }

    /// P1 of the Close Secure Session command
    pub const fn close_session_p1(&self) -> u8 {
        if self.ratification_requested { 0x80 } else { 0x00 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = TransactionSettings::default();
        assert!(!settings.multiple_session_enabled);
        assert!(!settings.allow_negative_balance);
        assert_eq!(settings.negative_balance_limit, 0);
        assert_eq!(settings.close_session_p1(), 0x00);
    }

    #[test]
    fn test_builders() {
        let settings = TransactionSettings::new()
            .with_multiple_session(true)
            .with_ratification_requested(true);
        assert!(settings.multiple_session_enabled);
        assert_eq!(settings.close_session_p1(), 0x80);
    }

    #[test]
    fn test_deserialize_partial() {
        let settings: TransactionSettings = serde_json::from_str(
            r#"{ "allow-negative-balance": true, "negative-balance-limit": -500 }"#,
        )
        .unwrap();
        assert!(settings.allow_negative_balance);
        assert_eq!(settings.negative_balance_limit, -500);
        assert!(!settings.multiple_session_enabled);

        let round_trip: TransactionSettings =
            serde_json::from_str(&serde_json::to_string(&settings).unwrap()).unwrap();
        assert_eq!(round_trip, settings);
    }
}
