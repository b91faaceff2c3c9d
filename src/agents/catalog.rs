//! Concrete agents. Each one is a plain value: a name, the contract its output
//! must satisfy, a system prompt and a prompt builder.

use crate::core::types::{IdeaCard, ModuleKind};
use crate::data::CompanyContext;
use crate::schema::validator::SchemaName;

/// What a prompt builder gets to look at.
#[derive(Clone, Copy, Debug)]
pub struct PromptContext<'a> {
    pub idea: &'a IdeaCard,
    pub company: Option<&'a CompanyContext>,
}

pub type PromptBuilder = fn(&PromptContext<'_>) -> String;

#[derive(Clone, Copy, Debug)]
pub struct AgentSpec {
    pub name: &'static str,
    pub schema: SchemaName,
    pub system_prompt: &'static str,
    pub build_prompt: PromptBuilder,
    /// Research module this agent fills, if any.
    pub module: Option<ModuleKind>,
    /// A failed required module aborts the whole packet.
    pub required: bool,
}

const EVIDENCE_RULES: &str = "Every claim must be backed by an entry in `evidence` with \
`source_type` (filing, transcript, news, data_provider, management, other), \
`reliability` (A best .. D worst), `claim_type` (fact, estimate, opinion) and a \
`locator` pointing at the exact document or dataset.";

pub const IDEA_ENRICHMENT: AgentSpec = AgentSpec {
    name: "idea_enrichment",
    schema: SchemaName::IdeaEnrichment,
    system_prompt: "# idea_enrichment\n\
You triage equity investment ideas for a research team. Rate each signal in [0, 1]. \
Respond with a single JSON object and nothing else.",
    build_prompt: enrichment_prompt,
    module: None,
    required: false,
};

pub const BUSINESS_MODEL: AgentSpec = AgentSpec {
    name: "business_model",
    schema: SchemaName::BusinessModel,
    system_prompt: "# business_model\n\
You are a buy-side analyst describing how a company makes money. \
Respond with a single JSON object and nothing else.",
    build_prompt: business_model_prompt,
    module: Some(ModuleKind::BusinessModel),
    required: true,
};

pub const INDUSTRY_MOAT: AgentSpec = AgentSpec {
    name: "industry_moat",
    schema: SchemaName::IndustryMoat,
    system_prompt: "# industry_moat\n\
You are a buy-side analyst assessing industry structure and competitive advantage. \
Respond with a single JSON object and nothing else.",
    build_prompt: industry_moat_prompt,
    module: Some(ModuleKind::IndustryMoat),
    required: false,
};

pub const FINANCIAL_FORENSICS: AgentSpec = AgentSpec {
    name: "financial_forensics",
    schema: SchemaName::FinancialForensics,
    system_prompt: "# financial_forensics\n\
You are a forensic accountant looking for earnings quality problems. \
Respond with a single JSON object and nothing else.",
    build_prompt: forensics_prompt,
    module: Some(ModuleKind::FinancialForensics),
    required: true,
};

pub const CAPITAL_ALLOCATION: AgentSpec = AgentSpec {
    name: "capital_allocation",
    schema: SchemaName::CapitalAllocation,
    system_prompt: "# capital_allocation\n\
You are a buy-side analyst grading management's capital allocation record. \
Respond with a single JSON object and nothing else.",
    build_prompt: capital_allocation_prompt,
    module: Some(ModuleKind::CapitalAllocation),
    required: false,
};

pub const MANAGEMENT_QUALITY: AgentSpec = AgentSpec {
    name: "management_quality",
    schema: SchemaName::ManagementQuality,
    system_prompt: "# management_quality\n\
You are a governance analyst assessing leadership quality and alignment. \
Respond with a single JSON object and nothing else.",
    build_prompt: management_prompt,
    module: Some(ModuleKind::ManagementQuality),
    required: false,
};

pub const VALUATION: AgentSpec = AgentSpec {
    name: "valuation",
    schema: SchemaName::Valuation,
    system_prompt: "# valuation\n\
You are a valuation specialist producing a fair value range. \
Respond with a single JSON object and nothing else.",
    build_prompt: valuation_prompt,
    module: Some(ModuleKind::Valuation),
    required: true,
};

pub const RISK_STRESS: AgentSpec = AgentSpec {
    name: "risk_stress",
    schema: SchemaName::RiskStress,
    system_prompt: "# risk_stress\n\
You are a risk manager stress testing an investment thesis. \
Respond with a single JSON object and nothing else.",
    build_prompt: risk_prompt,
    module: Some(ModuleKind::RiskStress),
    required: true,
};

pub const SCENARIOS: AgentSpec = AgentSpec {
    name: "scenarios",
    schema: SchemaName::Scenarios,
    system_prompt: "# scenarios\n\
You are a portfolio manager writing bull, base and bear cases. \
Respond with a single JSON object and nothing else.",
    build_prompt: scenarios_prompt,
    module: Some(ModuleKind::Scenarios),
    required: false,
};

/// Research agents in execution order.
pub const RESEARCH_AGENTS: [AgentSpec; 8] = [
    BUSINESS_MODEL,
    INDUSTRY_MOAT,
    FINANCIAL_FORENSICS,
    CAPITAL_ALLOCATION,
    MANAGEMENT_QUALITY,
    VALUATION,
    RISK_STRESS,
    SCENARIOS,
];

fn header(ctx: &PromptContext<'_>) -> String {
    let idea = ctx.idea;
    let mut out = format!(
        "Ticker: {}\nDirection: {:?}\nConfidence: {:?}\nStyle: {}\nThesis: {}\n",
        idea.ticker, idea.direction, idea.confidence, idea.style, idea.thesis
    );
    if let Some(company) = ctx.company {
        let p = &company.profile;
        out.push_str(&format!("Company: {}\n", p.name));
        if let Some(sector) = &p.sector {
            out.push_str(&format!("Sector: {sector}\n"));
        }
        if let Some(industry) = &p.industry {
            out.push_str(&format!("Industry: {industry}\n"));
        }
        if let Some(cap) = p.market_cap {
            out.push_str(&format!("Market cap: {cap:.0}\n"));
        }
        if let Some(desc) = &p.description {
            out.push_str(&format!("Description: {desc}\n"));
        }
    }
    out
}

fn dataset<T: serde::Serialize>(label: &str, value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(json) => format!("\n{label}:\n{json}\n"),
        Err(_) => String::new(),
    }
}

fn company_data(ctx: &PromptContext<'_>) -> String {
    let Some(company) = ctx.company else {
        return String::new();
    };
    let mut out = String::new();
    if let Some(m) = &company.metrics {
        out.push_str(&dataset("Key metrics", m));
    }
    if let Some(s) = &company.statements {
        out.push_str(&dataset("Financial statements (latest first)", &s.periods));
    }
    if let Some(e) = &company.estimates {
        out.push_str(&dataset("Consensus estimates", e));
    }
    if !company.news.is_empty() {
        out.push_str("\nRecent news:\n");
        for n in company.news.iter().take(10) {
            out.push_str(&format!("- {} ({})\n", n.headline, n.published_at.date_naive()));
        }
    }
    if !company.filings.is_empty() {
        out.push_str("\nFilings:\n");
        for f in company.filings.iter().take(10) {
            out.push_str(&format!("- {} filed {}\n", f.form, f.filed_at.date_naive()));
        }
    }
    if !company.transcripts.is_empty() {
        out.push_str("\nEarnings calls:\n");
        for t in company.transcripts.iter().take(4) {
            out.push_str(&format!(
                "- {}: {}\n",
                t.period,
                t.excerpt.as_deref().unwrap_or("(no excerpt)")
            ));
        }
    }
    out
}

fn research_prompt(ctx: &PromptContext<'_>, task: &str, fields: &str) -> String {
    format!(
        "{}{}\nTask: {task}\n\nReturn JSON with fields: {fields}.\n{EVIDENCE_RULES}",
        header(ctx),
        company_data(ctx),
    )
}

fn enrichment_prompt(ctx: &PromptContext<'_>) -> String {
    format!(
        "{}\nRate the idea on: edge_clarity (how specific and testable the edge is), \
valuation_tension (gap between price and plausible value), catalyst_timing (how near a \
catalyst is), business_quality (durability of the franchise) and disclosure_friction \
(how hard the company is to analyse from public disclosures). Include a short `rationale`.",
        header(ctx)
    )
}

fn business_model_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Explain the business model.",
        "summary, revenue_streams [{name, share_pct}], customer_segments, unit_economics, evidence",
    )
}

fn industry_moat_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Assess industry structure and the durability of any moat.",
        "industry_structure, moat_sources, moat_rating (none|narrow|wide), competitors, evidence",
    )
}

fn forensics_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Review revenue and earnings quality and list red flags.",
        "revenue_quality, earnings_quality_score (0-10), red_flags [{flag, severity (low|medium|high)}], accruals_comment, evidence",
    )
}

fn capital_allocation_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Grade the capital allocation track record.",
        "track_record, buybacks, acquisitions, dividend_policy, rating (poor|average|good|excellent), evidence",
    )
}

fn management_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Assess the management team.",
        "ceo_assessment, alignment, insider_ownership_pct, rating (poor|average|good|excellent), evidence",
    )
}

fn valuation_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Value the equity and give a low/base/high fair value per share.",
        "method, fair_value_low, fair_value_base, fair_value_high, current_price, upside_pct, key_assumptions, evidence",
    )
}

fn risk_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Identify the key risks to the thesis and describe a stress case.",
        "key_risks [{risk, probability, impact (low|medium|high), mitigant}], stress_case, evidence",
    )
}

fn scenarios_prompt(ctx: &PromptContext<'_>) -> String {
    research_prompt(
        ctx,
        "Write bull, base and bear scenarios with probabilities summing to roughly 1.",
        "bull, base, bear (each {narrative, probability, target_price}), evidence",
    )
}
