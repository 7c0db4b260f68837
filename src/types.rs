// =============================================================================
// Shared types used across the Vertex trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// How the engine talks to the brokerage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    /// No broker writes at all; placements are simulated locally.
    DryRun,
    /// Paper account against the broker's sandbox environment.
    SandboxPaper,
    /// Real funds.
    Live,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::DryRun
    }
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "DRY_RUN",
            Self::SandboxPaper => "SANDBOX_PAPER",
            Self::Live => "LIVE",
        }
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRY_RUN" => Ok(Self::DryRun),
            "SANDBOX_PAPER" => Ok(Self::SandboxPaper),
            "LIVE" => Ok(Self::Live),
            other => Err(format!("unknown trading mode: {other}")),
        }
    }
}

/// Engine-wide operating mode. HARD_STOP blocks all new entries until an
/// operator (or the risk accounting) clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemMode {
    Normal,
    HardStop,
}

impl Default for SystemMode {
    fn default() -> Self {
        Self::Normal
    }
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::HardStop => "HARD_STOP",
        }
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SystemMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "HARD_STOP" => Ok(Self::HardStop),
            other => Err(format!("unknown system mode: {other}")),
        }
    }
}

/// Put or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }

    /// The single-letter OCC code.
    pub fn occ_code(&self) -> char {
        match self {
            Self::Call => 'C',
            Self::Put => 'P',
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" | "CALL" | "C" => Ok(Self::Call),
            "put" | "PUT" | "P" => Ok(Self::Put),
            other => Err(format!("unknown option type: {other}")),
        }
    }
}

/// The four vertical-spread strategies the engine trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    BullPutCredit,
    BearCallCredit,
    BullCallDebit,
    BearPutDebit,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Self::BullPutCredit,
        Self::BearCallCredit,
        Self::BullCallDebit,
        Self::BearPutDebit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BullPutCredit => "BULL_PUT_CREDIT",
            Self::BearCallCredit => "BEAR_CALL_CREDIT",
            Self::BullCallDebit => "BULL_CALL_DEBIT",
            Self::BearPutDebit => "BEAR_PUT_DEBIT",
        }
    }

    /// True for spreads opened for a net credit.
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::BullPutCredit | Self::BearCallCredit)
    }

    /// Which option type both legs of this strategy use.
    pub fn option_type(&self) -> OptionType {
        match self {
            Self::BullPutCredit | Self::BearPutDebit => OptionType::Put,
            Self::BearCallCredit | Self::BullCallDebit => OptionType::Call,
        }
    }

    /// Long strike relative to the short strike, in multiples of the spread
    /// width. Negative means the long leg sits below the short leg.
    pub fn long_strike_offset(&self) -> f64 {
        match self {
            Self::BullPutCredit => -1.0,
            Self::BearCallCredit => 1.0,
            Self::BullCallDebit => -1.0,
            Self::BearPutDebit => 1.0,
        }
    }

    /// The long strike implied by a short strike and a width.
    pub fn expected_long_strike(&self, short_strike: f64, width: f64) -> f64 {
        short_strike + self.long_strike_offset() * width
    }

    /// Bullish strategies profit when the underlying rises.
    pub fn is_bullish(&self) -> bool {
        matches!(self, Self::BullPutCredit | Self::BullCallDebit)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BULL_PUT_CREDIT" => Ok(Self::BullPutCredit),
            "BEAR_CALL_CREDIT" => Ok(Self::BearCallCredit),
            "BULL_CALL_DEBIT" => Ok(Self::BullCallDebit),
            "BEAR_PUT_DEBIT" => Ok(Self::BearPutDebit),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Life-cycle of a managed trade.
///
/// EntryPending -> Open -> ClosingPending -> Closed. An exit rejection moves
/// ClosingPending back to Open so the next monitor cycle can retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    EntryPending,
    Open,
    ClosingPending,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntryPending => "ENTRY_PENDING",
            Self::Open => "OPEN",
            Self::ClosingPending => "CLOSING_PENDING",
            Self::Closed => "CLOSED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY_PENDING" => Ok(Self::EntryPending),
            "OPEN" => Ok(Self::Open),
            "CLOSING_PENDING" => Ok(Self::ClosingPending),
            "CLOSED" => Ok(Self::Closed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(format!("unknown trade status: {other}")),
        }
    }
}

/// Local order status. Advancement is monotonic through the DAG
/// PENDING -> PLACED -> PARTIAL -> {FILLED, CANCELLED, REJECTED}; terminal
/// statuses are never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Placed,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Placed => "PLACED",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Placed => 1,
            Self::Partial => 2,
            Self::Filled | Self::Cancelled | Self::Rejected => 3,
        }
    }

    /// Whether a transition from `self` to `next` is a legal advancement.
    /// Re-asserting the same status is allowed (idempotent reconciliation);
    /// moving backwards or out of a terminal status is not.
    pub fn can_advance(&self, next: OrderStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PLACED" => Ok(Self::Placed),
            "PARTIAL" => Ok(Self::Partial),
            "FILLED" => Ok(Self::Filled),
            "CANCELLED" => Ok(Self::Cancelled),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Whether an order opens or closes a spread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Entry,
    Exit,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(Self::Entry),
            "EXIT" => Ok(Self::Exit),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Life-cycle of a persisted proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    Ready,
    Consumed,
    Invalidated,
}

impl ProposalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Consumed => "CONSUMED",
            Self::Invalidated => "INVALIDATED",
        }
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(Self::Ready),
            "CONSUMED" => Ok(Self::Consumed),
            "INVALIDATED" => Ok(Self::Invalidated),
            other => Err(format!("unknown proposal status: {other}")),
        }
    }
}

/// Whether a proposal describes a new entry or an exit of an existing trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalKind {
    Entry,
    Exit,
}

impl ProposalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
        }
    }
}

impl std::fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProposalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENTRY" => Ok(Self::Entry),
            "EXIT" => Ok(Self::Exit),
            other => Err(format!("unknown proposal kind: {other}")),
        }
    }
}

/// Outcome of evaluating the ordered close rules against one open trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseTrigger {
    None,
    ProfitTarget,
    StopLoss,
    TrailProfit,
    TimeExit,
    IvCrushExit,
    LowValueClose,
    Emergency,
}

impl CloseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ProfitTarget => "PROFIT_TARGET",
            Self::StopLoss => "STOP_LOSS",
            Self::TrailProfit => "TRAIL_PROFIT",
            Self::TimeExit => "TIME_EXIT",
            Self::IvCrushExit => "IV_CRUSH_EXIT",
            Self::LowValueClose => "LOW_VALUE_CLOSE",
            Self::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for CloseTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a broker-held option leg we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            other => Err(format!("unknown position side: {other}")),
        }
    }
}

/// Discrete market state from spot vs the 20-period simple moving average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Bullish,
    Neutral,
    Bearish,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "BULLISH",
            Self::Neutral => "NEUTRAL",
            Self::Bearish => "BEARISH",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn strategy_geometry() {
        assert_eq!(Strategy::BullPutCredit.expected_long_strike(580.0, 5.0), 575.0);
        assert_eq!(Strategy::BearCallCredit.expected_long_strike(580.0, 5.0), 585.0);
        assert_eq!(Strategy::BullCallDebit.expected_long_strike(580.0, 5.0), 575.0);
        assert_eq!(Strategy::BearPutDebit.expected_long_strike(580.0, 5.0), 585.0);
    }

    #[test]
    fn strategy_option_types() {
        assert_eq!(Strategy::BullPutCredit.option_type(), OptionType::Put);
        assert_eq!(Strategy::BearCallCredit.option_type(), OptionType::Call);
        assert_eq!(Strategy::BullCallDebit.option_type(), OptionType::Call);
        assert_eq!(Strategy::BearPutDebit.option_type(), OptionType::Put);
    }

    #[test]
    fn strategy_credit_flags() {
        assert!(Strategy::BullPutCredit.is_credit());
        assert!(Strategy::BearCallCredit.is_credit());
        assert!(!Strategy::BullCallDebit.is_credit());
        assert!(!Strategy::BearPutDebit.is_credit());
    }

    #[test]
    fn order_status_never_regresses() {
        assert!(OrderStatus::Pending.can_advance(OrderStatus::Placed));
        assert!(OrderStatus::Placed.can_advance(OrderStatus::Partial));
        assert!(OrderStatus::Placed.can_advance(OrderStatus::Filled));
        assert!(OrderStatus::Partial.can_advance(OrderStatus::Cancelled));
        assert!(!OrderStatus::Placed.can_advance(OrderStatus::Pending));
        assert!(!OrderStatus::Partial.can_advance(OrderStatus::Placed));
    }

    #[test]
    fn order_status_terminal_is_sticky() {
        for terminal in [OrderStatus::Filled, OrderStatus::Cancelled, OrderStatus::Rejected] {
            assert!(!terminal.can_advance(OrderStatus::Pending));
            assert!(!terminal.can_advance(OrderStatus::Placed));
            // Re-asserting the same terminal status is fine.
            assert!(terminal.can_advance(terminal));
        }
        assert!(!OrderStatus::Filled.can_advance(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_advance(OrderStatus::Filled));
    }

    #[test]
    fn enum_string_roundtrips() {
        for s in Strategy::ALL {
            assert_eq!(Strategy::from_str(s.as_str()).unwrap(), s);
        }
        assert_eq!(TradingMode::from_str("SANDBOX_PAPER").unwrap(), TradingMode::SandboxPaper);
        assert_eq!(SystemMode::from_str("HARD_STOP").unwrap(), SystemMode::HardStop);
        assert_eq!(OrderStatus::from_str("PARTIAL").unwrap(), OrderStatus::Partial);
        assert!(Strategy::from_str("IRON_CONDOR").is_err());
    }
}
