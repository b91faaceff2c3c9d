use crate::schema::validator::{Field, SchemaName, Shape};
use std::collections::HashMap;

pub const EVIDENCE_SOURCE_TYPES: &[&str] = &[
    "filing",
    "transcript",
    "news",
    "data_provider",
    "management",
    "other",
];
pub const RELIABILITY_GRADES: &[&str] = &["A", "B", "C", "D"];
pub const CLAIM_TYPES: &[&str] = &["fact", "estimate", "opinion"];

const LEVELS: &[&str] = &["low", "medium", "high"];
const RATINGS: &[&str] = &["poor", "average", "good", "excellent"];

lazy_static::lazy_static! {
    static ref CONTRACTS: HashMap<SchemaName, Shape> = {
        let mut m = HashMap::new();
        m.insert(SchemaName::IdeaEnrichment, idea_enrichment());
        m.insert(SchemaName::BusinessModel, business_model());
        m.insert(SchemaName::IndustryMoat, industry_moat());
        m.insert(SchemaName::FinancialForensics, financial_forensics());
        m.insert(SchemaName::CapitalAllocation, capital_allocation());
        m.insert(SchemaName::ManagementQuality, management_quality());
        m.insert(SchemaName::Valuation, valuation());
        m.insert(SchemaName::RiskStress, risk_stress());
        m.insert(SchemaName::Scenarios, scenarios());
        m
    };
}

pub fn shape(name: SchemaName) -> &'static Shape {
    // every SchemaName variant is inserted above
    &CONTRACTS[&name]
}

fn evidence() -> Field {
    Field::required(
        "evidence",
        Shape::array_of(Shape::Object(vec![
            Field::required("source_type", Shape::Enum(EVIDENCE_SOURCE_TYPES)),
            Field::required("reliability", Shape::Enum(RELIABILITY_GRADES)),
            Field::required("claim_type", Shape::Enum(CLAIM_TYPES)),
            Field::required("locator", Shape::text()),
        ])),
    )
}

fn unit() -> Shape {
    Shape::ranged(0.0, 1.0)
}

fn idea_enrichment() -> Shape {
    Shape::Object(vec![
        Field::required("edge_clarity", unit()),
        Field::required("valuation_tension", unit()),
        Field::required("catalyst_timing", unit()),
        Field::required("business_quality", unit()),
        Field::required("disclosure_friction", unit()),
        Field::required("rationale", Shape::text()),
    ])
}

fn business_model() -> Shape {
    Shape::Object(vec![
        Field::required("summary", Shape::text()),
        Field::required(
            "revenue_streams",
            Shape::non_empty_array_of(Shape::Object(vec![
                Field::required("name", Shape::text()),
                Field::optional("share_pct", Shape::nullable(Shape::ranged(0.0, 100.0))),
            ])),
        ),
        Field::required("customer_segments", Shape::array_of(Shape::text())),
        Field::optional("unit_economics", Shape::nullable(Shape::text())),
        evidence(),
    ])
}

fn industry_moat() -> Shape {
    Shape::Object(vec![
        Field::required("industry_structure", Shape::text()),
        Field::required("moat_sources", Shape::array_of(Shape::text())),
        Field::required("moat_rating", Shape::Enum(&["none", "narrow", "wide"])),
        Field::required("competitors", Shape::array_of(Shape::text())),
        evidence(),
    ])
}

fn financial_forensics() -> Shape {
    Shape::Object(vec![
        Field::required("revenue_quality", Shape::text()),
        Field::required("earnings_quality_score", Shape::ranged(0.0, 10.0)),
        Field::required(
            "red_flags",
            Shape::array_of(Shape::Object(vec![
                Field::required("flag", Shape::text()),
                Field::required("severity", Shape::Enum(LEVELS)),
            ])),
        ),
        Field::optional("accruals_comment", Shape::nullable(Shape::text())),
        evidence(),
    ])
}

fn capital_allocation() -> Shape {
    Shape::Object(vec![
        Field::required("track_record", Shape::text()),
        Field::optional("buybacks", Shape::nullable(Shape::text())),
        Field::optional("acquisitions", Shape::nullable(Shape::text())),
        Field::optional("dividend_policy", Shape::nullable(Shape::text())),
        Field::required("rating", Shape::Enum(RATINGS)),
        evidence(),
    ])
}

fn management_quality() -> Shape {
    Shape::Object(vec![
        Field::required("ceo_assessment", Shape::text()),
        Field::required("alignment", Shape::text()),
        Field::optional(
            "insider_ownership_pct",
            Shape::nullable(Shape::ranged(0.0, 100.0)),
        ),
        Field::required("rating", Shape::Enum(RATINGS)),
        evidence(),
    ])
}

fn valuation() -> Shape {
    Shape::Object(vec![
        Field::required("method", Shape::text()),
        Field::required("fair_value_low", Shape::number()),
        Field::required("fair_value_base", Shape::number()),
        Field::required("fair_value_high", Shape::number()),
        Field::optional("current_price", Shape::nullable(Shape::number())),
        Field::optional("upside_pct", Shape::nullable(Shape::number())),
        Field::required("key_assumptions", Shape::non_empty_array_of(Shape::text())),
        evidence(),
    ])
}

fn risk_stress() -> Shape {
    Shape::Object(vec![
        Field::required(
            "key_risks",
            Shape::non_empty_array_of(Shape::Object(vec![
                Field::required("risk", Shape::text()),
                Field::required("probability", Shape::Enum(LEVELS)),
                Field::required("impact", Shape::Enum(LEVELS)),
                Field::optional("mitigant", Shape::nullable(Shape::text())),
            ])),
        ),
        Field::required("stress_case", Shape::text()),
        evidence(),
    ])
}

fn scenario() -> Shape {
    Shape::Object(vec![
        Field::required("narrative", Shape::text()),
        Field::required("probability", unit()),
        Field::optional("target_price", Shape::nullable(Shape::number())),
    ])
}

fn scenarios() -> Shape {
    Shape::Object(vec![
        Field::required("bull", scenario()),
        Field::required("base", scenario()),
        Field::required("bear", scenario()),
        evidence(),
    ])
}
