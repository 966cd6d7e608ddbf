//! Server-side HTML for the dashboard page

use std::fmt::Write;

use crate::models::{RankedEntry, StoredSummary};

const STYLE: &str = "body{font-family:sans-serif;margin:2rem;color:#222}\
h1{margin-bottom:0}section{margin-top:1.5rem}\
table{border-collapse:collapse;margin:.5rem 1.5rem .5rem 0;display:inline-table;vertical-align:top}\
th,td{border:1px solid #ccc;padding:.25rem .6rem;text-align:left}\
td.num{text-align:right}.muted{color:#777}";

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Full page for the latest summary, or a placeholder when there is none.
pub fn render_dashboard(latest: Option<&StoredSummary>, refresh_secs: u64) -> String {
    let mut body = String::new();
    match latest {
        None => body.push_str("<p class=\"muted\">No data available</p>"),
        Some(stored) => render_summary(&mut body, stored),
    }

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <meta http-equiv=\"refresh\" content=\"{refresh_secs}\">\n\
         <title>Crypto Market Analysis</title>\n<style>{STYLE}</style>\n</head>\n\
         <body>\n<h1>Crypto Market Analysis</h1>\n{body}\n</body>\n</html>\n"
    )
}

fn render_summary(out: &mut String, stored: &StoredSummary) {
    let summary = &stored.summary;
    let stats = &summary.pipeline_stats;
    let _ = write!(
        out,
        "<p class=\"muted\">Last updated {} &middot; {} of {} records analyzed, {} anomalies removed</p>",
        stored.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        stats.records_analyzed,
        stats.input_records,
        stats.anomalies_detected,
    );

    let caps = &summary.market_cap_analysis;
    out.push_str("<section><h2>Market Cap Analysis</h2><table>");
    stat_row(out, "Total market cap", &money(caps.total_market_cap));
    stat_row(out, "Top 10 market cap", &money(caps.top_10_market_cap));
    stat_row(out, "Mean", &money(caps.market_cap_distribution.mean));
    stat_row(out, "Median", &money(caps.market_cap_distribution.median));
    stat_row(out, "Std deviation", &money(caps.market_cap_distribution.std));
    out.push_str("</table></section>");

    let price = &summary.price_analysis;
    out.push_str("<section><h2>Price Analysis</h2><table>");
    stat_row(out, "Average 24h change", &percent(price.avg_price_change_24h));
    out.push_str("</table>");
    ranked_table(out, "Biggest gainers", &price.most_volatile, percent);
    ranked_table(out, "Biggest losers", &price.least_volatile, percent);
    out.push_str("</section>");

    let supply = &summary.supply_analysis;
    out.push_str("<section><h2>Supply Analysis</h2><table>");
    stat_row(out, "Average utilization", &ratio(supply.avg_supply_utilization));
    stat_row(out, "Assets with known supply", &supply.records_with_utilization.to_string());
    out.push_str("</table>");
    ranked_table(out, "Highest utilization", &supply.highest_utilization, ratio);
    ranked_table(out, "Lowest utilization", &supply.lowest_utilization, ratio);
    out.push_str("</section>");

    let top = &summary.top_performers;
    out.push_str("<section><h2>Top Performers</h2>");
    ranked_table(out, "By market cap", &top.by_market_cap, money);
    ranked_table(out, "By volume", &top.by_volume, money);
    ranked_table(out, "By 24h change", &top.by_price_change, percent);
    out.push_str("</section>");
}

fn stat_row(out: &mut String, label: &str, value: &str) {
    let _ = write!(out, "<tr><th>{label}</th><td class=\"num\">{value}</td></tr>");
}

fn ranked_table(out: &mut String, title: &str, entries: &[RankedEntry], fmt: fn(f64) -> String) {
    let _ = write!(out, "<table><tr><th colspan=\"2\">{title}</th></tr>");
    if entries.is_empty() {
        out.push_str("<tr><td colspan=\"2\" class=\"muted\">none</td></tr>");
    }
    for entry in entries {
        let _ = write!(
            out,
            "<tr><td>{}</td><td class=\"num\">{}</td></tr>",
            escape_html(&entry.name),
            fmt(entry.value)
        );
    }
    out.push_str("</table>");
}

fn money(v: f64) -> String {
    format!("${}", group_thousands(v))
}

fn percent(v: f64) -> String {
    format!("{v:+.2}%")
}

fn ratio(v: f64) -> String {
    format!("{:.1}%", v * 100.0)
}

/// `1234567.891` -> `1,234,567.89`
fn group_thousands(v: f64) -> String {
    let formatted = format!("{:.2}", v.abs());
    let (int_part, frac) = formatted.split_once('.').unwrap_or((formatted.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if v < 0.0 { "-" } else { "" };
    format!("{sign}{grouped}.{frac}")
}
