use crate::traits::{DynamicalSystem, Scalar};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error("Unknown variable or parameter '{0}'")]
    UnknownSymbol(String),

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Malformed bytecode: {0}")]
    MalformedBytecode(String),

    #[error("Failed to parse expression '{input}': {reason}")]
    Parse { input: String, reason: String },
}

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64, Dual or DoubleDouble).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes a state variable (free concentration or ODE state) by index.
    LoadVar(usize),
    /// Pushes a parameter (total concentration or Kd) by index.
    LoadParam(usize),
    /// Pushes a previously evaluated intermediate (derived species) by index.
    LoadSlot(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes exp(a).
    Exp,
    /// Pops top value (a), pushes ln(a).
    Ln,
    /// Pops top value (a), pushes sqrt(a).
    Sqrt,
    /// Pops top value (a), pushes -a.
    Neg,
}

impl OpCode {
    fn stack_effect(self) -> (usize, isize) {
        match self {
            OpCode::LoadConst(_) | OpCode::LoadVar(_) | OpCode::LoadParam(_) | OpCode::LoadSlot(_) => {
                (0, 1)
            }
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => (2, -1),
            OpCode::Exp | OpCode::Ln | OpCode::Sqrt | OpCode::Neg => (1, 0),
        }
    }
}

/// A validated sequence of operations leaving exactly one value on the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    ops: Vec<OpCode>,
    max_depth: usize,
}

impl Bytecode {
    /// Checks that `ops` never underflows the stack and yields a single value.
    pub fn from_ops(ops: Vec<OpCode>) -> Result<Self, CompileError> {
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for (pos, op) in ops.iter().enumerate() {
            let (pops, delta) = op.stack_effect();
            if depth < pops {
                return Err(CompileError::MalformedBytecode(format!(
                    "stack underflow at instruction {pos} ({op:?})"
                )));
            }
            depth = (depth as isize + delta) as usize;
            max_depth = max_depth.max(depth);
        }
        if depth != 1 {
            return Err(CompileError::MalformedBytecode(format!(
                "program leaves {depth} values on the stack"
            )));
        }
        Ok(Self { ops, max_depth })
    }

    pub fn ops(&self) -> &[OpCode] {
        &self.ops
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: State vector (read-only).
/// - `params`: Parameter vector (read-only).
/// - `slots`: Intermediate values computed by earlier programs (read-only).
/// - `stack`: A mutable buffer for intermediate computations.
pub struct VM;

impl VM {
    /// Executes the bytecode and returns the value left on the stack.
    ///
    /// Out-of-range indices evaluate to NaN, which the solvers report as
    /// non-convergence rather than panicking.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        params: &[T],
        slots: &[T],
        stack: &mut Vec<T>,
    ) -> T {
        stack.clear();
        let load = |values: &[T], idx: usize| values.get(idx).copied().unwrap_or_else(T::nan);

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::of(val)),
                OpCode::LoadVar(idx) => stack.push(load(vars, idx)),
                OpCode::LoadParam(idx) => stack.push(load(params, idx)),
                OpCode::LoadSlot(idx) => stack.push(load(slots, idx)),
                OpCode::Add => binary(stack, |a, b| a + b),
                OpCode::Sub => binary(stack, |a, b| a - b),
                OpCode::Mul => binary(stack, |a, b| a * b),
                OpCode::Div => binary(stack, |a, b| a / b),
                OpCode::Pow => binary(stack, |a, b| a.powf(b)),
                OpCode::Exp => unary(stack, |a| a.exp()),
                OpCode::Ln => unary(stack, |a| a.ln()),
                OpCode::Sqrt => unary(stack, |a| a.sqrt()),
                OpCode::Neg => unary(stack, |a| -a),
            }
        }

        stack.pop().unwrap_or_else(T::nan)
    }
}

#[inline]
fn binary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T, T) -> T) {
    let b = stack.pop().unwrap_or_else(T::nan);
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a, b));
}

#[inline]
fn unary<T: Scalar>(stack: &mut Vec<T>, f: impl Fn(T) -> T) {
    let a = stack.pop().unwrap_or_else(T::nan);
    stack.push(f(a));
}

// --- AST ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Add | BinaryOp::Sub => 1,
            BinaryOp::Mul | BinaryOp::Div => 2,
            BinaryOp::Pow => 3,
        }
    }

    fn opcode(self) -> OpCode {
        match self {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Pow => OpCode::Pow,
        }
    }
}

/// Abstract syntax tree for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Box<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }

    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::Binary(Box::new(lhs), op, Box::new(rhs))
    }

    /// Left-associated sum of `terms`; `0` when empty.
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        terms
            .into_iter()
            .reduce(|acc, t| Expr::binary(acc, BinaryOp::Add, t))
            .unwrap_or(Expr::Number(0.0))
    }

    /// `count * self`, eliding the factor when it is one.
    pub fn times(self, count: u32) -> Self {
        if count == 1 {
            self
        } else {
            Expr::binary(Expr::Number(count as f64), BinaryOp::Mul, self)
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(_, op, _) => op.precedence(),
            Expr::Neg(_) => 4,
            _ => 5,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Neg(inner) => {
                if inner.precedence() < 4 {
                    write!(f, "-({inner})")
                } else {
                    write!(f, "-{inner}")
                }
            }
            Expr::Call(func, arg) => write!(f, "{func}({arg})"),
            Expr::Binary(lhs, op, rhs) => {
                let prec = op.precedence();
                let wrap_lhs = match op {
                    BinaryOp::Pow => lhs.precedence() < 5,
                    _ => lhs.precedence() < prec,
                };
                if wrap_lhs {
                    write!(f, "({lhs})")?;
                } else {
                    write!(f, "{lhs}")?;
                }
                write!(f, " {} ", op.symbol())?;
                // Right operands of equal precedence need parentheses for - and /.
                if rhs.precedence() <= prec && !matches!(op, BinaryOp::Add | BinaryOp::Mul)
                    || rhs.precedence() < prec
                {
                    write!(f, "({rhs})")
                } else {
                    write!(f, "{rhs}")
                }
            }
        }
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`.
/// Resolves names against state variables, then intermediate slots, then parameters.
pub struct Compiler {
    pub var_map: HashMap<String, usize>,
    pub slot_map: HashMap<String, usize>,
    pub param_map: HashMap<String, usize>,
}

fn index_map(names: &[String]) -> HashMap<String, usize> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect()
}

impl Compiler {
    pub fn new(var_names: &[String], param_names: &[String]) -> Self {
        Self {
            var_map: index_map(var_names),
            slot_map: HashMap::new(),
            param_map: index_map(param_names),
        }
    }

    pub fn with_slots(mut self, slot_names: &[String]) -> Self {
        self.slot_map = index_map(slot_names);
        self
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, CompileError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Bytecode::from_ops(ops)
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), CompileError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => {
                let op = if let Some(&idx) = self.var_map.get(name) {
                    OpCode::LoadVar(idx)
                } else if let Some(&idx) = self.slot_map.get(name) {
                    OpCode::LoadSlot(idx)
                } else if let Some(&idx) = self.param_map.get(name) {
                    OpCode::LoadParam(idx)
                } else {
                    return Err(CompileError::UnknownSymbol(name.clone()));
                };
                ops.push(op);
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(op.opcode());
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                let op = match func.as_str() {
                    "exp" => OpCode::Exp,
                    "ln" | "log" => OpCode::Ln,
                    "sqrt" => OpCode::Sqrt,
                    _ => return Err(CompileError::UnknownFunction(func.clone())),
                };
                ops.push(op);
            }
        }
        Ok(())
    }
}

// --- Parser ---

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, CompileError> {
    let fail = |reason: String| CompileError::Parse {
        input: input.to_string(),
        reason,
    };
    let tokens = tokenize(input).map_err(fail)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression().map_err(fail)?;
    if let Some(token) = parser.peek() {
        return Err(fail(format!("unexpected trailing token {token:?}")));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '-' || d == '+') && num_str.ends_with(|e: char| e == 'e' || e == 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("invalid number '{num_str}'"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("unexpected character '{other}'")),
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_power()
    }

    /// Exponentiation binds tighter than unary minus and is right-associative.
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::binary(base, BinaryOp::Pow, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    match self.consume() {
                        Some(Token::RParen) => Ok(Expr::Call(name, Box::new(arg))),
                        _ => Err("expected ')'".to_string()),
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of input".to_string()),
        }
    }
}

// --- EquationSystem ---

/// A `DynamicalSystem` evaluating one compiled expression per state variable.
pub struct EquationSystem<T: Scalar> {
    pub equations: Vec<Bytecode>,
    pub params: Vec<T>,
    // Interior mutability for the VM stack avoids allocating in `apply`.
    // This makes the system !Sync; build one per thread.
    stack: RefCell<Vec<T>>,
}

impl<T: Scalar> EquationSystem<T> {
    pub fn new(equations: Vec<Bytecode>, params: Vec<T>) -> Self {
        let depth = equations.iter().map(Bytecode::max_depth).max().unwrap_or(0);
        Self {
            equations,
            params,
            stack: RefCell::new(Vec::with_capacity(depth)),
        }
    }
}

impl<T: Scalar> DynamicalSystem<T> for EquationSystem<T> {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, _t: T, x: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        for (i, eq) in self.equations.iter().enumerate() {
            out[i] = VM::execute(eq, x, &self.params, &[], &mut stack);
        }
    }
}
