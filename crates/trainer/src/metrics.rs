//! Scoring predicted answers against reference labels.

const EQUATION_TOLERANCE: f64 = 1e-4;

pub fn exact_match(prediction: &str, reference: &str) -> bool {
    prediction.trim() == reference.trim()
}

/// Both sides evaluated as arithmetic; unparsable predictions are wrong.
pub fn equation_match(prediction: &str, reference: &str) -> bool {
    match (eval_expression(prediction), eval_expression(reference)) {
        (Some(p), Some(r)) => (p - r).abs() < EQUATION_TOLERANCE,
        _ => false,
    }
}

/// Running tally for one evaluation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct Tally {
    pub evaluated: usize,
    pub correct: usize,
    pub equation_correct: usize,
}

impl Tally {
    pub fn record(&mut self, prediction: &str, reference: &str) {
        self.evaluated += 1;
        if exact_match(prediction, reference) {
            self.correct += 1;
        }
        if equation_match(prediction, reference) {
            self.equation_correct += 1;
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct, self.evaluated)
    }

    pub fn equation_accuracy(&self) -> f64 {
        ratio(self.equation_correct, self.evaluated)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Evaluates `+ - * /`, parentheses, unary minus and decimal literals.
/// Returns `None` on syntax errors, trailing input or a non-finite result.
pub fn eval_expression(text: &str) -> Option<f64> {
    let mut parser = ExprParser {
        chars: text.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
    };
    let value = parser.expr()?;
    if parser.pos != parser.chars.len() || !value.is_finite() {
        return None;
    }
    Some(value)
}

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn expr(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            value = if op == '*' { value * rhs } else { value / rhs };
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            '-' => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            '+' => {
                self.pos += 1;
                self.factor()
            }
            '(' => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek()? != ')' {
                    return None;
                }
                self.pos += 1;
                Some(value)
            }
            _ => self.number(),
        }
    }

    fn number(&mut self) -> Option<f64> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        self.chars[start..self.pos].iter().collect::<String>().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_precedence_and_parentheses() {
        assert_eq!(eval_expression("2 + 3 * 4"), Some(14.0));
        assert_eq!(eval_expression("( 2 + 3 ) * 4"), Some(20.0));
        assert_eq!(eval_expression("-(1.5 - 4)"), Some(2.5));
        assert_eq!(eval_expression("10 / 4"), Some(2.5));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert_eq!(eval_expression("2 +"), None);
        assert_eq!(eval_expression("(3"), None);
        assert_eq!(eval_expression("three"), None);
        assert_eq!(eval_expression("1 / 0"), None);
        assert_eq!(eval_expression(""), None);
    }

    #[test]
    fn equivalent_equations_match() {
        assert!(equation_match("(12.0 - 5.0)", "( 14 / 2 )"));
        assert!(!equation_match("(12.0 - 4.0)", "( 14 / 2 )"));
        assert!(!equation_match("seven", "7"));
    }

    #[test]
    fn tally_reports_ratios() {
        let mut tally = Tally::default();
        tally.record(" river ", "river");
        tally.record("sea", "river");
        assert_eq!(tally.accuracy(), 0.5);
        assert_eq!(Tally::default().accuracy(), 0.0);
    }
}
