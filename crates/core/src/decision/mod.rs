use crate::domain::post::Suggestion;

/// Lenient normalization of a free-form decision string.
/// Priority: buy, then sell; anything else is Hold.
pub fn normalize(text: &str) -> Suggestion {
    let lowered = text.trim().to_lowercase();
    if lowered.contains("buy") {
        Suggestion::Buy
    } else if lowered.contains("sell") {
        Suggestion::Sell
    } else {
        Suggestion::Hold
    }
}

/// Strict scan over multi-line engine chatter. A line counts only if it looks
/// like an explicit verdict (mentions "final", "proposal", "decision", or
/// contains a colon); the last matching line wins, so a transcript's closing
/// verdict overrides earlier hedging.
pub fn scan_decision(text: &str) -> Option<Suggestion> {
    let mut last = None;
    for line in text.lines() {
        let lowered = line.to_lowercase();
        if !looks_like_decision(&lowered) {
            continue;
        }
        if lowered.contains("buy") {
            last = Some(Suggestion::Buy);
        } else if lowered.contains("sell") {
            last = Some(Suggestion::Sell);
        } else if lowered.contains("hold") {
            last = Some(Suggestion::Hold);
        }
    }
    last
}

/// Strict scan restricted to report lines that mention the given ticker.
pub fn scan_decision_for_ticker(report: &str, ticker: &str) -> Option<Suggestion> {
    let needle = ticker.to_uppercase();
    let relevant: Vec<&str> = report
        .lines()
        .filter(|line| line.to_uppercase().contains(&needle))
        .collect();
    scan_decision(&relevant.join("\n"))
}

fn looks_like_decision(lowered: &str) -> bool {
    lowered.contains("final")
        || lowered.contains("proposal")
        || lowered.contains("decision")
        || lowered.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_total_and_prioritizes_buy() {
        assert_eq!(normalize("Strong BUY recommendation"), Suggestion::Buy);
        assert_eq!(normalize("we should sell"), Suggestion::Sell);
        assert_eq!(normalize("buy now, or maybe sell later"), Suggestion::Buy);
        assert_eq!(normalize("hold steady"), Suggestion::Hold);
        assert_eq!(normalize(""), Suggestion::Hold);
        assert_eq!(normalize("no signal at all"), Suggestion::Hold);
    }

    #[test]
    fn scan_requires_a_decision_marker() {
        assert_eq!(scan_decision("I'd buy this all day"), None);
        assert_eq!(scan_decision("Final call: buy"), Some(Suggestion::Buy));
        assert_eq!(scan_decision("proposal is to sell"), Some(Suggestion::Sell));
        assert_eq!(scan_decision("decision made, hold"), Some(Suggestion::Hold));
    }

    #[test]
    fn scan_takes_the_last_matching_line() {
        let transcript = "analyst: leaning buy here\n\
                          risk desk: too volatile, sell\n\
                          chatter without any marker buy buy buy\n\
                          FINAL TRADE DECISION: HOLD";
        assert_eq!(scan_decision(transcript), Some(Suggestion::Hold));
    }

    #[test]
    fn scan_for_ticker_ignores_other_symbols() {
        let report = "AAPL: final decision buy\nMSFT: final decision sell";
        assert_eq!(scan_decision_for_ticker(report, "MSFT"), Some(Suggestion::Sell));
        assert_eq!(scan_decision_for_ticker(report, "aapl"), Some(Suggestion::Buy));
        assert_eq!(scan_decision_for_ticker(report, "TSLA"), None);
    }
}
