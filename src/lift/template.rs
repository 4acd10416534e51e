//! Directive arguments captured at lift time and evaluated when the lifted
//! atom runs.

use std::collections::HashMap;

use oxc::ast::ast::{
    ArrayExpressionElement, Expression, ObjectPropertyKind, PropertyKey, UnaryOperator,
};
use oxc::span::GetSpan;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum ArgTemplate {
    Literal(Value),
    /// Value of the lifted atom's positional parameter.
    Param(usize),
    Template(Vec<TemplatePart>),
    Array(Vec<ArgTemplate>),
    Object(Vec<(String, ArgTemplate)>),
    /// An expression that cannot be evaluated statically, kept as source text.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Expr(ArgTemplate),
}

impl ArgTemplate {
    pub fn evaluate(&self, params: &[Value]) -> Value {
        match self {
            ArgTemplate::Literal(value) => value.clone(),
            ArgTemplate::Param(index) => params.get(*index).cloned().unwrap_or(Value::Null),
            ArgTemplate::Template(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(chunk) => text.push_str(chunk),
                        TemplatePart::Expr(expr) => text.push_str(&interpolate(&expr.evaluate(params))),
                    }
                }
                Value::String(text)
            }
            ArgTemplate::Array(items) => {
                Value::Array(items.iter().map(|item| item.evaluate(params)).collect())
            }
            ArgTemplate::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.evaluate(params)))
                    .collect::<Map<String, Value>>(),
            ),
            ArgTemplate::Opaque(source) => Value::String(source.clone()),
        }
    }

    /// The string value of a top-level `identifier` property, if any.
    pub fn identifier(&self) -> Option<&str> {
        match self {
            ArgTemplate::Object(entries) => entries.iter().find_map(|(key, value)| match value {
                ArgTemplate::Literal(Value::String(s)) if key == "identifier" => Some(s.as_str()),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Arguments of a call: one argument is passed as is, several as an array.
pub fn evaluate_arguments(args: &[ArgTemplate], params: &[Value]) -> Value {
    match args {
        [] => Value::Null,
        [single] => single.evaluate(params),
        _ => Value::Array(args.iter().map(|arg| arg.evaluate(params)).collect()),
    }
}

/// How a value reads inside template text.
fn interpolate(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Builds templates from expressions. Identifiers aliasing lifted atoms turn
/// into positional parameters.
pub(crate) struct TemplateBuilder<'s> {
    pub source: &'s str,
    pub aliases: &'s HashMap<String, String>,
    /// Atoms in parameter order.
    pub params: &'s [String],
}

impl TemplateBuilder<'_> {
    pub fn build(&self, expr: &Expression<'_>) -> ArgTemplate {
        match expr {
            Expression::StringLiteral(lit) => ArgTemplate::Literal(Value::String(lit.value.to_string())),
            Expression::NumericLiteral(lit) => ArgTemplate::Literal(number(lit.value)),
            Expression::BooleanLiteral(lit) => ArgTemplate::Literal(Value::Bool(lit.value)),
            Expression::NullLiteral(_) => ArgTemplate::Literal(Value::Null),
            Expression::Identifier(ident) if ident.name == "undefined" => {
                ArgTemplate::Literal(Value::Null)
            }
            Expression::Identifier(ident) => match self.param_index(ident.name.as_str()) {
                Some(index) => ArgTemplate::Param(index),
                None => self.opaque(expr),
            },
            Expression::ParenthesizedExpression(inner) => self.build(&inner.expression),
            Expression::UnaryExpression(unary) if unary.operator == UnaryOperator::UnaryNegation => {
                match &unary.argument {
                    Expression::NumericLiteral(lit) => ArgTemplate::Literal(number(-lit.value)),
                    _ => self.opaque(expr),
                }
            }
            Expression::TemplateLiteral(template) => {
                let mut parts = Vec::new();
                for (index, quasi) in template.quasis.iter().enumerate() {
                    let text = quasi
                        .value
                        .cooked
                        .as_ref()
                        .map(|cooked| cooked.to_string())
                        .unwrap_or_else(|| quasi.value.raw.to_string());
                    if !text.is_empty() {
                        parts.push(TemplatePart::Text(text));
                    }
                    if let Some(expr) = template.expressions.get(index) {
                        parts.push(TemplatePart::Expr(self.build(expr)));
                    }
                }
                ArgTemplate::Template(parts)
            }
            Expression::ArrayExpression(array) => {
                let mut items = Vec::with_capacity(array.elements.len());
                for element in &array.elements {
                    match element {
                        ArrayExpressionElement::SpreadElement(_) => return self.opaque(expr),
                        ArrayExpressionElement::Elision(_) => items.push(ArgTemplate::Literal(Value::Null)),
                        _ => match element.as_expression() {
                            Some(item) => items.push(self.build(item)),
                            None => return self.opaque(expr),
                        },
                    }
                }
                ArgTemplate::Array(items)
            }
            Expression::ObjectExpression(object) => {
                let mut entries = Vec::with_capacity(object.properties.len());
                for property in &object.properties {
                    let ObjectPropertyKind::ObjectProperty(property) = property else {
                        return self.opaque(expr);
                    };
                    let key = match &property.key {
                        PropertyKey::StaticIdentifier(ident) => ident.name.to_string(),
                        PropertyKey::StringLiteral(lit) => lit.value.to_string(),
                        _ => return self.opaque(expr),
                    };
                    entries.push((key, self.build(&property.value)));
                }
                ArgTemplate::Object(entries)
            }
            _ => self.opaque(expr),
        }
    }

    fn param_index(&self, variable: &str) -> Option<usize> {
        let atom = self.aliases.get(variable)?;
        self.params.iter().position(|param| param == atom)
    }

    fn opaque(&self, expr: &Expression<'_>) -> ArgTemplate {
        let span = expr.span();
        ArgTemplate::Opaque(self.source[span.start as usize..span.end as usize].to_string())
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    }
}
