use crate::data::{FinancialStatements, StatementPeriod};

/// Piotroski F-score (0-9) from the two most recent annual periods.
/// Returns `None` when fewer than two periods are available. Tests whose
/// inputs are missing score zero.
pub fn piotroski_f_score(statements: &FinancialStatements) -> Option<u8> {
    // feeds do not agree on period order
    let mut periods: Vec<&StatementPeriod> = statements.periods.iter().collect();
    periods.sort_by(|a, b| b.fiscal_year.cmp(&a.fiscal_year));
    let [cur, prev, ..] = periods.as_slice() else {
        return None;
    };
    let (cur, prev) = (*cur, *prev);

    let roa = |p: &StatementPeriod| ratio(p.net_income, p.total_assets);
    let leverage = |p: &StatementPeriod| ratio(p.long_term_debt, p.total_assets);
    let current_ratio = |p: &StatementPeriod| ratio(p.current_assets, p.current_liabilities);
    let gross_margin = |p: &StatementPeriod| ratio(p.gross_profit, p.revenue);
    let turnover = |p: &StatementPeriod| ratio(p.revenue, p.total_assets);

    let tests = [
        // profitability
        roa(cur).map(|r| r > 0.0),
        cur.operating_cash_flow.map(|cfo| cfo > 0.0),
        both(roa(cur), roa(prev)).map(|(c, p)| c > p),
        both(cur.operating_cash_flow, cur.net_income).map(|(cfo, ni)| cfo > ni),
        // leverage and liquidity
        both(leverage(cur), leverage(prev)).map(|(c, p)| c < p),
        both(current_ratio(cur), current_ratio(prev)).map(|(c, p)| c > p),
        both(cur.shares_outstanding, prev.shares_outstanding).map(|(c, p)| c <= p),
        // efficiency
        both(gross_margin(cur), gross_margin(prev)).map(|(c, p)| c > p),
        both(turnover(cur), turnover(prev)).map(|(c, p)| c > p),
    ];

    Some(tests.iter().filter(|t| matches!(t, Some(true))).count() as u8)
}

/// Business-quality prior in [0,1].
pub fn quality_prior(statements: &FinancialStatements) -> Option<f64> {
    piotroski_f_score(statements).map(|f| f64::from(f) / 9.0)
}

fn ratio(num: Option<f64>, den: Option<f64>) -> Option<f64> {
    match (num, den) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d),
        _ => None,
    }
}

fn both(a: Option<f64>, b: Option<f64>) -> Option<(f64, f64)> {
    Some((a?, b?))
}
