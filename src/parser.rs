//! Instruction text parsing.
//!
//! Program source is a `;`-separated sequence of `NAME(arg, …)` calls:
//!
//! ```text
//! DECLARE(VAR, 1); WRITE(00000, 45); FOR([ADD(VAR, VAR, 1)], 4);
//! PRINT("Value of VAR: ", VAR)
//! ```
//!
//! Splitting is bracket-aware at every level: the top-level split on `;`
//! and the argument split on `,` both track `()` and `[]` nesting, so
//! `FOR` bodies, including nested `FOR`s, parse correctly. A `FOR` body
//! argument is a bracketed program that is interpreted recursively.
//!
//! Malformed instructions are skipped with a warning; the executor only
//! ever sees well-formed [`Instruction`] values.

use log::warn;

use crate::inst::{Instruction, Operand};

/// Parse a program, skipping (and logging) malformed instructions.
pub fn parse_program(source: &str) -> Vec<Instruction> {
    let mut program = Vec::new();

    for chunk in split_top_level(source) {
        let Some(tokens) = tokenize_instruction(&chunk) else {
            warn!("skipping malformed instruction {chunk:?}");
            continue;
        };
        match interpret(&tokens) {
            Some(instruction) => program.push(instruction),
            None => warn!("skipping malformed instruction {chunk:?}"),
        }
    }

    program
}

/// Split source on `;` at zero `()`/`[]` nesting depth.
fn split_top_level(source: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut parens = 0i32;
    let mut brackets = 0i32;

    for c in source.chars() {
        match c {
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }

        if c == ';' && parens == 0 && brackets == 0 {
            if !current.trim().is_empty() {
                chunks.push(current.clone());
            }
            current.clear();
        } else {
            current.push(c);
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Strip surrounding whitespace, then one layer of quotes, then one layer
/// of brackets.
fn trim_and_unquote(token: &str) -> String {
    let mut token = token.trim();
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        token = &token[1..token.len() - 1];
    }
    if token.len() >= 2 && token.starts_with('[') && token.ends_with(']') {
        token = &token[1..token.len() - 1];
    }
    token.to_string()
}

/// Break one `NAME(arg, …)` call into `[name, arg…]` tokens. The argument
/// split on `,` tracks both `()` and `[]` so arguments containing nested
/// calls stay whole.
fn tokenize_instruction(instruction: &str) -> Option<Vec<String>> {
    let instruction = instruction.trim();

    let Some(open) = instruction.find('(') else {
        // A bare word (no parameters).
        return Some(vec![trim_and_unquote(instruction)]);
    };

    let close = instruction.rfind(')')?;
    if close <= open {
        return None;
    }

    let mut tokens = vec![trim_and_unquote(&instruction[..open])];

    let parameters = &instruction[open + 1..close];
    let mut current = String::new();
    let mut parens = 0i32;
    let mut brackets = 0i32;

    for c in parameters.chars() {
        match c {
            '(' => parens += 1,
            ')' => parens -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }

        if c == ',' && parens == 0 && brackets == 0 {
            if !current.trim().is_empty() {
                tokens.push(trim_and_unquote(&current));
            }
            current.clear();
        } else {
            current.push(c);
        }
    }
    if !current.trim().is_empty() {
        tokens.push(trim_and_unquote(&current));
    }

    Some(tokens)
}

/// Build an instruction from its tokens.
fn interpret(tokens: &[String]) -> Option<Instruction> {
    match tokens.first().map(String::as_str)? {
        "ADD" => interpret_arithmetic(tokens, true),
        "SUBTRACT" => interpret_arithmetic(tokens, false),
        "DECLARE" => interpret_declare(tokens),
        "FOR" => interpret_for(tokens),
        "PRINT" => interpret_print(tokens),
        "READ" => interpret_read(tokens),
        "SLEEP" => interpret_sleep(tokens),
        "WRITE" => interpret_write(tokens),
        _ => None,
    }
}

fn interpret_arithmetic(tokens: &[String], add: bool) -> Option<Instruction> {
    if tokens.len() != 4 || !is_identifier(&tokens[1]) {
        return None;
    }

    let dest = tokens[1].clone();
    let first = operand(&tokens[2])?;
    let second = operand(&tokens[3])?;

    Some(if add {
        Instruction::Add {
            dest,
            first,
            second,
        }
    } else {
        Instruction::Subtract {
            dest,
            first,
            second,
        }
    })
}

fn interpret_declare(tokens: &[String]) -> Option<Instruction> {
    if !is_identifier(tokens.get(1)?) {
        return None;
    }

    match tokens.len() {
        2 => Some(Instruction::Declare {
            name: tokens[1].clone(),
            value: None,
        }),
        3 => Some(Instruction::Declare {
            name: tokens[1].clone(),
            value: Some(tokens[2].parse().ok()?),
        }),
        _ => None,
    }
}

fn interpret_for(tokens: &[String]) -> Option<Instruction> {
    if tokens.len() != 3 || !is_digits(&tokens[2]) {
        return None;
    }

    // The body is itself a program; brackets were already stripped.
    let body = parse_program(&tokens[1]);
    Some(Instruction::For {
        body,
        count: tokens[2].parse().ok()?,
    })
}

fn interpret_print(tokens: &[String]) -> Option<Instruction> {
    match tokens.len() {
        2 => Some(Instruction::Print {
            message: tokens[1].clone(),
            variable: None,
        }),
        3 if is_identifier(&tokens[2]) => Some(Instruction::Print {
            message: tokens[1].clone(),
            variable: Some(tokens[2].clone()),
        }),
        _ => None,
    }
}

fn interpret_read(tokens: &[String]) -> Option<Instruction> {
    if tokens.len() != 3 || !is_identifier(&tokens[1]) {
        return None;
    }
    Some(Instruction::Read {
        dest: tokens[1].clone(),
        address: parse_hex(&tokens[2])?,
    })
}

fn interpret_sleep(tokens: &[String]) -> Option<Instruction> {
    if tokens.len() != 2 {
        return None;
    }
    Some(Instruction::Sleep {
        ticks: tokens[1].parse().ok()?,
    })
}

fn interpret_write(tokens: &[String]) -> Option<Instruction> {
    if tokens.len() != 3 || !is_digits(&tokens[2]) {
        return None;
    }
    Some(Instruction::Write {
        address: parse_hex(&tokens[1])?,
        value: tokens[2].parse().ok()?,
    })
}

/// Literal if all digits, variable if a valid identifier.
fn operand(token: &str) -> Option<Operand> {
    if is_digits(token) {
        Some(Operand::Literal(token.parse().ok()?))
    } else if is_identifier(token) {
        Some(Operand::Variable(token.to_string()))
    } else {
        None
    }
}

/// First character alphabetic, no whitespace anywhere.
fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    !token.chars().any(char::is_whitespace)
}

fn is_digits(token: &str) -> bool {
    !token.is_empty() && token.chars().all(|c| c.is_ascii_digit())
}

/// Hex address, optionally `0x`-prefixed.
fn parse_hex(token: &str) -> Option<u32> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_sequence() {
        let program = parse_program("DECLARE(X, 5); ADD(X, X, 1); SLEEP(3)");
        assert_eq!(program.len(), 3);
        assert_eq!(
            program[0],
            Instruction::Declare {
                name: "X".into(),
                value: Some(5)
            }
        );
        assert_eq!(
            program[1],
            Instruction::Add {
                dest: "X".into(),
                first: Operand::Variable("X".into()),
                second: Operand::Literal(1),
            }
        );
        assert_eq!(program[2], Instruction::Sleep { ticks: 3 });
    }

    #[test]
    fn test_declare_without_value() {
        let program = parse_program("DECLARE(V)");
        assert_eq!(
            program,
            vec![Instruction::Declare {
                name: "V".into(),
                value: None
            }]
        );
    }

    #[test]
    fn test_print_with_quoted_message() {
        let program = parse_program("PRINT(\"Value of VAR: \", VAR)");
        assert_eq!(
            program,
            vec![Instruction::Print {
                message: "Value of VAR: ".into(),
                variable: Some("VAR".into()),
            }]
        );
    }

    #[test]
    fn test_read_write_addresses() {
        let program = parse_program("WRITE(00000, 45); READ(VB, 0x0020)");
        assert_eq!(
            program,
            vec![
                Instruction::Write {
                    address: 0,
                    value: 45
                },
                Instruction::Read {
                    dest: "VB".into(),
                    address: 0x20
                },
            ]
        );
    }

    #[test]
    fn test_operand_order_preserved() {
        // A literal first operand stays first.
        let program = parse_program("SUBTRACT(X, 10, Y)");
        assert_eq!(
            program,
            vec![Instruction::Subtract {
                dest: "X".into(),
                first: Operand::Literal(10),
                second: Operand::Variable("Y".into()),
            }]
        );
    }

    #[test]
    fn test_for_loop() {
        let program = parse_program("FOR([ADD(V, V, 1); ADD(V, V, 1)], 4)");
        match &program[0] {
            Instruction::For { body, count } => {
                assert_eq!(*count, 4);
                assert_eq!(body.len(), 2);
            }
            other => panic!("expected FOR, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_for() {
        let program = parse_program("DECLARE(V, 0); FOR([FOR([ADD(V, V, 1)], 4)], 4)");
        assert_eq!(program.len(), 2);
        match &program[1] {
            Instruction::For { body, count } => {
                assert_eq!(*count, 4);
                match &body[0] {
                    Instruction::For { body, count } => {
                        assert_eq!(*count, 4);
                        assert_eq!(
                            body[0],
                            Instruction::Add {
                                dest: "V".into(),
                                first: Operand::Variable("V".into()),
                                second: Operand::Literal(1),
                            }
                        );
                    }
                    other => panic!("expected inner FOR, got {other:?}"),
                }
            }
            other => panic!("expected FOR, got {other:?}"),
        }
    }

    #[test]
    fn test_for_body_with_trailing_semicolon() {
        // Trailing semicolons inside a body are tolerated.
        let program = parse_program("FOR([FOR([ADD(VAR, VAR, 1)], 4);], 4);");
        match &program[0] {
            Instruction::For { body, .. } => assert_eq!(body.len(), 1),
            other => panic!("expected FOR, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_instructions_skipped() {
        let program = parse_program(
            "DECLARE(X, 5); BOGUS(1); ADD(X); SLEEP(300); WRITE(GG, 4); ADD(X, X, 1)",
        );
        // Only the two well-formed instructions survive.
        assert_eq!(program.len(), 2);
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_identifier("VAR"));
        assert!(is_identifier("v2"));
        assert!(!is_identifier("2V"));
        assert!(!is_identifier("HAS SPACE"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn test_literal_bounds() {
        // 16-bit literals only; an overflowing literal is malformed.
        assert!(parse_program("DECLARE(X, 65535)").len() == 1);
        assert!(parse_program("DECLARE(X, 65536)").is_empty());
    }

    #[test]
    fn test_empty_source() {
        assert!(parse_program("").is_empty());
        assert!(parse_program("  ;  ; ").is_empty());
    }
}
