//! Shared test helpers for integration tests

#![allow(dead_code)]

use metajit::bytecode::{BinaryOp, FunctionBuilder, Location, Program};
use metajit::jit::{Dispatcher, JitConfig};
use metajit::runtime::{Effects, Value};
use std::sync::Arc;

/// Merge point of [`counting_loop`]
pub const COUNTING_HEAD: Location = Location { func: 0, pc: 3 };
/// Merge point of [`promotion_loop`]
pub const PROMOTION_HEAD: Location = Location { func: 0, pc: 4 };
/// Promotion site of [`promotion_loop`]
pub const PROMOTION_SITE: Location = Location { func: 0, pc: 8 };

pub fn program(b: FunctionBuilder) -> Arc<Program> {
    Arc::new(Program::single(b.build().unwrap()).unwrap())
}

/// Prints 0..n, then returns n
pub fn counting_loop(n: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.print(0);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// For i in 0..n: x = i % k; promote x; print x * x. Returns n.
pub fn promotion_loop(n: i64, k: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.konst(5, Value::Int(k));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.binary(BinaryOp::Rem, 4, 0, 5);
    b.promote(4);
    b.mul(6, 4, 4);
    b.print(6);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// Bindings of [`promotion_loop`] standing at its promotion site with `x`
pub fn at_promotion_site(n: i64, k: i64, i: i64, x: i64) -> metajit::runtime::Bindings {
    let mut bindings = metajit::runtime::Bindings::new(7);
    bindings.set(0, Value::Int(i), false);
    bindings.set(1, Value::Int(n), false);
    bindings.set(2, Value::Int(1), false);
    bindings.set(3, Value::Int(1), false);
    bindings.set(4, Value::Int(x), false);
    bindings.set(5, Value::Int(k), false);
    bindings
}

/// Reads n values and prints each after promoting it
pub fn input_promotion_loop() -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let done = b.new_label();
    b.input(1);
    b.konst(0, Value::Int(0));
    b.konst(2, Value::Int(1));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.input(4);
    b.promote(4);
    b.print(4);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// For i in 0..n: if i % 2 == 0 { y = i } else { y = -i }; print y
pub fn simple_split_loop(n: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let odd = b.new_label();
    let join = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.konst(5, Value::Int(2));
    b.konst(7, Value::Int(0));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.binary(BinaryOp::Rem, 4, 0, 5);
    b.eq(4, 4, 7);
    b.branch(4, odd, Some(join));
    b.mov(6, 0);
    b.jump(join);
    b.bind(odd);
    b.sub(6, 7, 0);
    b.bind(join);
    b.print(6);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// For i in 0..n: t = if i % m == 0 { (i, 1) } else { (i, 2) }; print t.1
///
/// With `m == 1` the first arm is always taken.
pub fn allocating_split_loop(n: i64, m: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let other = b.new_label();
    let join = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.konst(5, Value::Int(m));
    b.konst(7, Value::Int(0));
    b.konst(8, Value::Int(2));
    b.bind(head);
    b.merge_point(&[]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.binary(BinaryOp::Rem, 4, 0, 5);
    b.eq(4, 4, 7);
    b.branch(4, other, Some(join));
    b.alloc(6, &[0, 2]);
    b.jump(join);
    b.bind(other);
    b.alloc(6, &[0, 8]);
    b.bind(join);
    b.get_field(9, 6, 1);
    b.print(9);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// Merge point keyed by the green `i % 2`; prints (i % 2) * 10 + i
pub fn green_mode_loop(n: i64) -> Arc<Program> {
    let mut b = FunctionBuilder::new("main");
    let head = b.new_label();
    let done = b.new_label();
    b.konst(0, Value::Int(0));
    b.konst(1, Value::Int(n));
    b.konst(2, Value::Int(1));
    b.konst(5, Value::Int(2));
    b.konst(8, Value::Int(10));
    b.bind(head);
    b.binary(BinaryOp::Rem, 6, 0, 5);
    b.merge_point(&[6]);
    b.lt(3, 0, 1);
    b.branch(3, done, None);
    b.mul(7, 6, 8);
    b.add(7, 7, 0);
    b.print(7);
    b.add(0, 0, 2);
    b.jump(head);
    b.bind(done);
    b.ret(0);
    program(b)
}

/// main calls a pure `square` and an effectful `echo` in a loop
pub fn calling_loop(n: i64) -> Arc<Program> {
    let mut main = FunctionBuilder::new("main");
    let head = main.new_label();
    let done = main.new_label();
    main.konst(0, Value::Int(0));
    main.konst(1, Value::Int(n));
    main.konst(2, Value::Int(1));
    main.bind(head);
    main.merge_point(&[]);
    main.lt(3, 0, 1);
    main.branch(3, done, None);
    main.call(4, 1, &[0]);
    main.call(5, 2, &[4]);
    main.promote(5);
    main.add(0, 0, 2);
    main.jump(head);
    main.bind(done);
    main.ret(0);

    let mut square = FunctionBuilder::new("square").params(1);
    square.mul(1, 0, 0);
    square.ret(1);

    let mut echo = FunctionBuilder::new("echo").params(1);
    echo.print(0);
    echo.ret(0);

    let functions = vec![
        main.build().unwrap(),
        square.build().unwrap(),
        echo.build().unwrap(),
    ];
    Arc::new(Program::new(functions, 0).unwrap())
}

/// Run `program` and return its result and output
pub fn run(program: &Arc<Program>, config: JitConfig, input: &[i64]) -> (Value, Vec<Value>, Dispatcher) {
    let mut dispatcher = Dispatcher::new(program.clone(), config).unwrap();
    let mut effects = Effects::with_input(input.iter().copied().map(Value::Int));
    let result = dispatcher.run_program(&mut effects).unwrap();
    (result, effects.output().to_vec(), dispatcher)
}

/// Run `program` interpreted only and with `config`, asserting both agree
pub fn assert_equivalent(program: &Arc<Program>, config: JitConfig, input: &[i64]) -> Dispatcher {
    let (expected, expected_output, _) = run(program, JitConfig::interpreted_only(), input);
    let (result, output, dispatcher) = run(program, config, input);
    pretty_assertions::assert_eq!(result, expected);
    pretty_assertions::assert_eq!(output, expected_output);
    dispatcher
}
