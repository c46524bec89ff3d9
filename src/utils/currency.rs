/// Currency helpers for Philippine peso amounts.
///
/// All monetary values are stored in centavos (1 peso = 100 centavos)
/// to avoid floating-point precision issues.

/// Convert pesos to centavos (multiply by 100)
pub fn peso_to_centavos(peso: f64) -> i64 {
    (peso * 100.0).round() as i64
}

/// Format centavos as a peso string with 2 decimal places
pub fn format_centavos(centavos: i64) -> String {
    let sign = if centavos < 0 { "-" } else { "" };
    let abs = centavos.unsigned_abs();
    format!("{}₱{}.{:02}", sign, group_thousands(abs / 100), abs % 100)
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peso_to_centavos() {
        assert_eq!(peso_to_centavos(1000.0), 100_000);
        assert_eq!(peso_to_centavos(0.50), 50);
        assert_eq!(peso_to_centavos(123.45), 12_345);
    }

    #[test]
    fn test_format_centavos() {
        assert_eq!(format_centavos(50_000), "₱500.00");
        assert_eq!(format_centavos(5), "₱0.05");
        assert_eq!(format_centavos(123_456_789), "₱1,234,567.89");
        assert_eq!(format_centavos(-150), "-₱1.50");
    }
}
