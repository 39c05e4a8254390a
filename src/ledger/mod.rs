//! Funding proposal ledger and its persistence

pub mod ledger;
pub mod store;

pub use ledger::ProposalLedger;
pub use store::LedgerStore;

use rust_decimal_macros::dec;

use crate::domain::Proposal;

/// Proposals a fresh ledger starts with
pub fn default_proposals() -> Vec<Proposal> {
    vec![
        Proposal::new(
            "prop_001",
            "A-01",
            "Claim testnet ETH to bootstrap initial operations.",
            dec!(0),
            dec!(0.1),
        ),
        Proposal::new(
            "prop_002",
            "A-13",
            "Provide liquidity to DEX pools for fee generation.",
            dec!(0.05),
            dec!(0.5),
        ),
    ]
}

/// Ledger holding the default proposals
pub fn seeded_ledger() -> ProposalLedger {
    let mut ledger = ProposalLedger::new();
    for proposal in default_proposals() {
        // Ids above are unique
        let _ = ledger.submit(proposal);
    }
    ledger
}
