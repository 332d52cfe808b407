//! Agent tags for responder replies.
//!
//! The backend routes each request through a supervisor that may delegate to
//! a specialist agent; its reply carries a free-form `agent` tag. This module
//! pins the known tags down to a closed enum with stable `snake_case`
//! identifiers for storage, accepts the backend's historical class-style
//! aliases on parse, and falls back to [`AgentTag::Supervisor`] for anything
//! unrecognized so an unknown tag can never fail a send.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical tag of the agent that produced an assistant message.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTag {
    /// Orchestrating agent; also the fallback for unknown tags.
    #[default]
    Supervisor,
    /// Co-founder sparring partner.
    Cofounder,
    /// Simulated venture-capital interviewer.
    VcSimulator,
    /// Grant and funding-program scout.
    GrantHunter,
    /// Market and trend analysis.
    MarketSensor,
    /// MVP scoping and build planning.
    MvpBuilder,
    /// Business framework construction.
    FrameworkDesigner,
    /// Growth and acquisition tactics.
    GrowthHacker,
    /// Legal and compliance guidance.
    LegalAdvisor,
}

/// Parse error for [`AgentTag`].
#[derive(Debug, Clone)]
pub struct AgentTagParseError {
    value: String,
}

impl AgentTagParseError {
    /// The raw value that failed parsing.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for AgentTagParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown agent tag: {}", self.value)
    }
}

impl std::error::Error for AgentTagParseError {}

impl AgentTag {
    /// All known tags.
    pub const ALL: &'static [Self] = &[
        Self::Supervisor,
        Self::Cofounder,
        Self::VcSimulator,
        Self::GrantHunter,
        Self::MarketSensor,
        Self::MvpBuilder,
        Self::FrameworkDesigner,
        Self::GrowthHacker,
        Self::LegalAdvisor,
    ];

    /// Stable storage identifier (matches the wire `agent` column).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Cofounder => "cofounder",
            Self::VcSimulator => "vc_simulator",
            Self::GrantHunter => "grant_hunter",
            Self::MarketSensor => "market_sensor",
            Self::MvpBuilder => "mvp_builder",
            Self::FrameworkDesigner => "framework_designer",
            Self::GrowthHacker => "growth_hacker",
            Self::LegalAdvisor => "legal_advisor",
        }
    }

    /// Human-readable name for display in a transcript header.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Supervisor => "Supervisor",
            Self::Cofounder => "Co-Founder",
            Self::VcSimulator => "VC Simulator",
            Self::GrantHunter => "Grant Hunter",
            Self::MarketSensor => "Market Sensor",
            Self::MvpBuilder => "MVP Builder",
            Self::FrameworkDesigner => "Framework Designer",
            Self::GrowthHacker => "Growth Hacker",
            Self::LegalAdvisor => "Legal Advisor",
        }
    }

    /// Lossy parsing for wire values: unknown tags become `Supervisor`.
    ///
    /// The backend must never be able to break a send with a new tag, so the
    /// fallback is unconditional.
    #[must_use]
    pub fn from_wire(raw: &str) -> Self {
        Self::from_str(raw).unwrap_or(Self::Supervisor)
    }
}

impl fmt::Display for AgentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AgentTag {
    type Err = AgentTagParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();

        // Canonical snake_case identifiers.
        for tag in Self::ALL {
            if raw.eq_ignore_ascii_case(tag.as_str()) {
                return Ok(*tag);
            }
        }

        // Class-style aliases emitted by older backend builds.
        let tag = if raw.eq_ignore_ascii_case("CofounderAgent") {
            Self::Cofounder
        } else if raw.eq_ignore_ascii_case("VCSimulator") {
            Self::VcSimulator
        } else if raw.eq_ignore_ascii_case("GrantHunter") {
            Self::GrantHunter
        } else if raw.eq_ignore_ascii_case("MarketSensor") {
            Self::MarketSensor
        } else if raw.eq_ignore_ascii_case("MVPBuilder") {
            Self::MvpBuilder
        } else if raw.eq_ignore_ascii_case("FrameworkDesigner") {
            Self::FrameworkDesigner
        } else if raw.eq_ignore_ascii_case("GrowthHacker") {
            Self::GrowthHacker
        } else if raw.eq_ignore_ascii_case("LegalAdvisor") {
            Self::LegalAdvisor
        } else if raw.eq_ignore_ascii_case("SupervisorAgent") {
            Self::Supervisor
        } else {
            return Err(AgentTagParseError {
                value: raw.to_string(),
            });
        };

        Ok(tag)
    }
}
