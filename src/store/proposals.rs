// =============================================================================
// Proposal persistence
// =============================================================================

use anyhow::{Context, Result};

use super::models::{proposal_from_row, Proposal};
use super::{now_rfc3339, Store};
use crate::types::{ProposalKind, ProposalStatus};

impl Store {
    pub async fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        sqlx::query(
            "INSERT INTO proposals (id, symbol, expiration, short_strike, long_strike, width,
                quantity, strategy, credit_target, score, score_ivr, score_vertical_skew,
                score_term_structure, score_delta_fitness, score_ev, status, kind,
                linked_trade_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&proposal.id)
        .bind(&proposal.symbol)
        .bind(&proposal.expiration)
        .bind(proposal.short_strike)
        .bind(proposal.long_strike)
        .bind(proposal.width)
        .bind(proposal.quantity)
        .bind(proposal.strategy.as_str())
        .bind(proposal.credit_target)
        .bind(proposal.score)
        .bind(proposal.score_ivr)
        .bind(proposal.score_vertical_skew)
        .bind(proposal.score_term_structure)
        .bind(proposal.score_delta_fitness)
        .bind(proposal.score_ev)
        .bind(proposal.status.as_str())
        .bind(proposal.kind.as_str())
        .bind(&proposal.linked_trade_id)
        .bind(&proposal.created_at)
        .execute(self.pool())
        .await
        .with_context(|| format!("failed to insert proposal {}", proposal.id))?;
        Ok(())
    }

    pub async fn get_proposal(&self, id: &str) -> Result<Option<Proposal>> {
        let row = sqlx::query("SELECT * FROM proposals WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(proposal_from_row).transpose()
    }

    pub async fn set_proposal_status(&self, id: &str, status: ProposalStatus) -> Result<()> {
        sqlx::query("UPDATE proposals SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(self.pool())
            .await
            .with_context(|| format!("failed to update proposal {id}"))?;
        Ok(())
    }

    /// The most recent entry proposal still waiting to be acted on.
    pub async fn latest_ready_entry_proposal(&self) -> Result<Option<Proposal>> {
        let row = sqlx::query(
            "SELECT * FROM proposals WHERE status = ? AND kind = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(ProposalStatus::Ready.as_str())
        .bind(ProposalKind::Entry.as_str())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(proposal_from_row).transpose()
    }

    pub async fn recent_proposals(&self, limit: i64) -> Result<Vec<Proposal>> {
        let rows = sqlx::query("SELECT * FROM proposals ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(proposal_from_row).collect()
    }

    pub async fn count_proposals(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proposals")
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Strategy;

    fn sample_proposal(id: &str) -> Proposal {
        Proposal {
            id: id.to_string(),
            symbol: "SPY".to_string(),
            expiration: "2025-01-17".to_string(),
            short_strike: 580.0,
            long_strike: 575.0,
            width: 5.0,
            quantity: 1,
            strategy: Strategy::BullPutCredit,
            credit_target: 1.05,
            score: 0.72,
            score_ivr: 0.5,
            score_vertical_skew: 0.8,
            score_term_structure: 0.5,
            score_delta_fitness: 0.9,
            score_ev: 0.6,
            status: ProposalStatus::Ready,
            kind: ProposalKind::Entry,
            linked_trade_id: None,
            created_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn insert_and_status_transitions() {
        let store = Store::open_in_memory().await.unwrap();
        store.insert_proposal(&sample_proposal("p1")).await.unwrap();

        let p = store.get_proposal("p1").await.unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Ready);
        assert_eq!(p.strategy, Strategy::BullPutCredit);

        store.set_proposal_status("p1", ProposalStatus::Consumed).await.unwrap();
        let p = store.get_proposal("p1").await.unwrap().unwrap();
        assert_eq!(p.status, ProposalStatus::Consumed);
    }

    #[tokio::test]
    async fn latest_ready_skips_consumed() {
        let store = Store::open_in_memory().await.unwrap();
        let mut p1 = sample_proposal("p1");
        p1.created_at = "2025-01-17T10:00:00+00:00".to_string();
        let mut p2 = sample_proposal("p2");
        p2.created_at = "2025-01-17T11:00:00+00:00".to_string();
        store.insert_proposal(&p1).await.unwrap();
        store.insert_proposal(&p2).await.unwrap();
        store.set_proposal_status("p2", ProposalStatus::Invalidated).await.unwrap();

        let latest = store.latest_ready_entry_proposal().await.unwrap().unwrap();
        assert_eq!(latest.id, "p1");
    }
}
