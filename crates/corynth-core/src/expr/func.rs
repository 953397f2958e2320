// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Function-call expression surface: `var.x == "y"`,
//! `and(var.a, equal(var.e, "p"))`, `if(c, t, f)`, literals, lists and
//! objects.

use crate::context::Scope;
use crate::error::{EngineError, Result};
use crate::value::Value;
use std::collections::HashMap;

/// Evaluates a function-call form expression against a scope.
pub fn evaluate(expr: &str, scope: &Scope) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        source: expr,
    };
    let ast = parser.parse_expression()?;
    parser.expect_end()?;
    eval(&ast, scope)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Assign,
    Colon,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(parse_error(input, i, "unexpected '!'"));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(input, i, "unterminated string")),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| parse_error(input, i, "dangling escape"))?;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '-' | '0'..='9' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e' || chars[i] == 'E' || chars[i] == '+')
                {
                    // A '.' followed by a letter terminates the number (path access).
                    if chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_alphabetic()) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(input, start, "malformed number"))?;
                tokens.push(Token::Number(number));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(parse_error(input, i, "unexpected character")),
        }
    }

    Ok(tokens)
}

fn parse_error(source: &str, position: usize, message: &str) -> EngineError {
    EngineError::Parse(format!(
        "{message} at offset {position} in expression '{source}'"
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone)]
enum Ast {
    Literal(Value),
    List(Vec<Ast>),
    ObjectLit(Vec<(String, Ast)>),
    Reference(Vec<String>),
    Call(String, Vec<Ast>),
    Compare(CmpOp, Box<Ast>, Box<Ast>),
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn error(&self, message: &str) -> EngineError {
        EngineError::Parse(format!("{message} in expression '{}'", self.source))
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(self.error(&format!("expected {what}"))),
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.position == self.tokens.len() {
            Ok(())
        } else {
            Err(self.error("trailing tokens"))
        }
    }

    fn parse_expression(&mut self) -> Result<Ast> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Ge) => Some(CmpOp::Ge),
            _ => None,
        };
        match op {
            Some(op) => {
                self.next();
                let right = self.parse_primary()?;
                Ok(Ast::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Ast> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Ast::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Ast::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => self.parse_list(),
            Some(Token::LBrace) => self.parse_object(),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Ast::Literal(Value::Bool(true))),
                "false" => Ok(Ast::Literal(Value::Bool(false))),
                "null" => Ok(Ast::Literal(Value::Null)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let args = self.parse_args()?;
                        Ok(Ast::Call(name, args))
                    } else if self.peek() == Some(&Token::Dot) {
                        let mut path = vec![name];
                        while self.peek() == Some(&Token::Dot) {
                            self.next();
                            match self.next() {
                                Some(Token::Ident(segment)) => path.push(segment),
                                _ => return Err(self.error("expected identifier after '.'")),
                            }
                        }
                        Ok(Ast::Reference(path))
                    } else {
                        // A bare identifier is a reference with a single
                        // segment; resolution will reject unknown roots.
                        Ok(Ast::Reference(vec![name]))
                    }
                }
            },
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Ast>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
        Ok(args)
    }

    fn parse_list(&mut self) -> Result<Ast> {
        let mut items = Vec::new();
        if self.peek() == Some(&Token::RBracket) {
            self.next();
            return Ok(Ast::List(items));
        }
        loop {
            items.push(self.parse_expression()?);
            match self.next() {
                Some(Token::Comma) => {
                    if self.peek() == Some(&Token::RBracket) {
                        self.next();
                        break;
                    }
                }
                Some(Token::RBracket) => break,
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
        Ok(Ast::List(items))
    }

    fn parse_object(&mut self) -> Result<Ast> {
        let mut entries = Vec::new();
        if self.peek() == Some(&Token::RBrace) {
            self.next();
            return Ok(Ast::ObjectLit(entries));
        }
        loop {
            let key = match self.next() {
                Some(Token::Ident(k)) => k,
                Some(Token::Str(k)) => k,
                _ => return Err(self.error("expected object key")),
            };
            match self.next() {
                Some(Token::Assign) | Some(Token::Colon) => {}
                _ => return Err(self.error("expected '=' or ':' after object key")),
            }
            entries.push((key, self.parse_expression()?));
            match self.next() {
                Some(Token::Comma) => {
                    if self.peek() == Some(&Token::RBrace) {
                        self.next();
                        break;
                    }
                }
                Some(Token::RBrace) => break,
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
        Ok(Ast::ObjectLit(entries))
    }
}

fn eval(ast: &Ast, scope: &Scope) -> Result<Value> {
    match ast {
        Ast::Literal(value) => Ok(value.clone()),
        Ast::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Ast::ObjectLit(entries) => {
            let mut out = HashMap::with_capacity(entries.len());
            for (key, value) in entries {
                out.insert(key.clone(), eval(value, scope)?);
            }
            Ok(Value::Object(out))
        }
        Ast::Reference(path) => {
            let segments: Vec<&str> = path.iter().map(String::as_str).collect();
            scope.resolve(&segments)
        }
        Ast::Compare(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            compare(*op, &left, &right)
        }
        Ast::Call(name, args) => eval_call(name, args, scope),
    }
}

fn eval_call(name: &str, args: &[Ast], scope: &Scope) -> Result<Value> {
    let arity = |expected: usize| -> Result<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(EngineError::Parse(format!(
                "function '{name}' expects {expected} argument(s), got {}",
                args.len()
            )))
        }
    };

    match name {
        "and" => {
            for arg in args {
                if !eval(arg, scope)?.try_bool()? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "or" => {
            for arg in args {
                if eval(arg, scope)?.try_bool()? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "not" => {
            arity(1)?;
            Ok(Value::Bool(!eval(&args[0], scope)?.try_bool()?))
        }
        "if" => {
            arity(3)?;
            // Only the selected branch is evaluated, so the other side may
            // reference values that are not in scope.
            if eval(&args[0], scope)?.try_bool()? {
                eval(&args[1], scope)
            } else {
                eval(&args[2], scope)
            }
        }
        "equal" => {
            arity(2)?;
            compare(CmpOp::Eq, &eval(&args[0], scope)?, &eval(&args[1], scope)?)
        }
        "notequal" => {
            arity(2)?;
            compare(CmpOp::Ne, &eval(&args[0], scope)?, &eval(&args[1], scope)?)
        }
        "lessthan" => {
            arity(2)?;
            compare(CmpOp::Lt, &eval(&args[0], scope)?, &eval(&args[1], scope)?)
        }
        "greaterthan" => {
            arity(2)?;
            compare(CmpOp::Gt, &eval(&args[0], scope)?, &eval(&args[1], scope)?)
        }
        "length" => {
            arity(1)?;
            let value = eval(&args[0], scope)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(entries) => entries.len(),
                other => {
                    return Err(EngineError::type_mismatch(
                        "string, array or object",
                        other.type_name(),
                    ))
                }
            };
            Ok(Value::Number(len as f64))
        }
        "contains" => {
            arity(2)?;
            let haystack = eval(&args[0], scope)?;
            let needle = eval(&args[1], scope)?;
            let found = match &haystack {
                Value::String(s) => s.contains(needle.try_str()?),
                Value::Array(items) => items.iter().any(|item| item == &needle),
                Value::Object(entries) => {
                    entries.contains_key(needle.try_str()?)
                }
                other => {
                    return Err(EngineError::type_mismatch(
                        "string, array or object",
                        other.type_name(),
                    ))
                }
            };
            Ok(Value::Bool(found))
        }
        other => Err(EngineError::Parse(format!("unknown function '{other}'"))),
    }
}

/// Comparison with the coercion rules of the evaluator: comparing a number
/// against a numeric-looking string parses the string first.
pub(crate) fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<Value> {
    let result = match op {
        CmpOp::Eq => loose_equal(left, right),
        CmpOp::Ne => !loose_equal(left, right),
        CmpOp::Lt | CmpOp::Gt | CmpOp::Le | CmpOp::Ge => {
            let ordering = loose_order(left, right)?;
            match op {
                CmpOp::Lt => ordering == std::cmp::Ordering::Less,
                CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
                CmpOp::Le => ordering != std::cmp::Ordering::Greater,
                CmpOp::Ge => ordering != std::cmp::Ordering::Less,
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}

fn loose_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().map(|parsed| parsed == *n).unwrap_or(false)
        }
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            match s.to_ascii_lowercase().as_str() {
                "true" => *b,
                "false" => !*b,
                _ => false,
            }
        }
        _ => left == right,
    }
}

fn loose_order(left: &Value, right: &Value) -> Result<std::cmp::Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        // Two numeric strings compare numerically, otherwise lexicographically.
        if let (Ok(na), Ok(nb)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
            return na
                .partial_cmp(&nb)
                .ok_or_else(|| EngineError::type_mismatch("comparable numbers", "NaN"));
        }
        return Ok(a.cmp(b));
    }

    let a = left.try_number()?;
    let b = right.try_number()?;
    a.partial_cmp(&b)
        .ok_or_else(|| EngineError::type_mismatch("comparable numbers", "NaN"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope() -> Scope {
        let mut variables = HashMap::new();
        variables.insert("env".to_string(), Value::String("prod".into()));
        variables.insert("count".to_string(), Value::Number(3.0));
        variables.insert("debug".to_string(), Value::Bool(false));
        let mut scope = Scope::of_variables(variables);
        scope.steps.insert(
            "fetch".to_string(),
            HashMap::from([("status".to_string(), Value::String("200".into()))]),
        );
        scope
    }

    fn eval_str(expr: &str) -> Result<Value> {
        evaluate(expr, &scope())
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval_str("42").unwrap(), Value::Number(42.0));
        assert_eq!(eval_str("-1.5").unwrap(), Value::Number(-1.5));
        assert_eq!(eval_str("\"hi\"").unwrap(), Value::String("hi".into()));
        assert_eq!(eval_str("'hi'").unwrap(), Value::String("hi".into()));
        assert_eq!(eval_str("true").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("null").unwrap(), Value::Null);
    }

    #[test]
    fn test_collections() {
        assert_eq!(
            eval_str("[1, 2, 3]").unwrap(),
            Value::Array(vec![
                Value::Number(1.0),
                Value::Number(2.0),
                Value::Number(3.0)
            ])
        );
        let obj = eval_str("{name = \"x\", n: 2}").unwrap();
        assert_eq!(obj.get("name").unwrap(), &Value::String("x".into()));
        assert_eq!(obj.get("n").unwrap(), &Value::Number(2.0));
    }

    #[test]
    fn test_infix_comparison() {
        assert_eq!(eval_str("var.env == \"prod\"").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("var.env != \"prod\"").unwrap(), Value::Bool(false));
        assert_eq!(eval_str("var.count > 2").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("var.count <= 2").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_numeric_string_coercion_in_compare() {
        assert_eq!(
            eval_str("step.fetch.status == 200").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("lessthan(step.fetch.status, 300)").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_boolean_functions() {
        assert_eq!(
            eval_str("and(var.env == \"prod\", not(var.debug))").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("or(var.debug, equal(var.count, 3))").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("notequal(var.env, \"dev\")").unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_if_is_lazy() {
        // The untaken branch references a step that never ran.
        assert_eq!(
            eval_str("if(true, \"yes\", step.ghost.out)").unwrap(),
            Value::String("yes".into())
        );
        assert!(matches!(
            eval_str("if(false, \"yes\", step.ghost.out)"),
            Err(EngineError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_unresolved_reference() {
        assert!(matches!(
            eval_str("var.nope"),
            Err(EngineError::UnresolvedReference(_))
        ));
        assert!(matches!(
            eval_str("step.never.out"),
            Err(EngineError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_type_mismatch_in_condition_functions() {
        assert!(matches!(
            eval_str("and([1], true)"),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_length_and_contains() {
        assert_eq!(eval_str("length([1,2,3])").unwrap(), Value::Number(3.0));
        assert_eq!(
            eval_str("contains(\"production\", \"prod\")").unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_str("contains([1, 2], 3)").unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(eval_str("var."), Err(EngineError::Parse(_))));
        assert!(matches!(eval_str("equal(1"), Err(EngineError::Parse(_))));
        assert!(matches!(eval_str("1 2"), Err(EngineError::Parse(_))));
        assert!(matches!(eval_str("mystery(1)"), Err(EngineError::Parse(_))));
    }

    #[test]
    fn test_string_ordering() {
        assert_eq!(eval_str("\"abc\" < \"abd\"").unwrap(), Value::Bool(true));
        assert_eq!(eval_str("\"10\" > \"9\"").unwrap(), Value::Bool(true));
    }
}
