use cinder_vm_runtime::bytecode::{Instruction, Opcode, Program};
use cinder_vm_runtime::engine::{CancelToken, Engine, EngineConfig, RunReport};
use cinder_vm_runtime::exec::{ErrorKind, Outcome};
use cinder_vm_runtime::host::NullHost;
use cinder_vm_runtime::trace::{FinishEvent, Observer, StepEvent, TraceRecorder};

fn program(instructions: &[Instruction]) -> Program {
    Program::from_instructions(instructions.to_vec()).expect("program within addressable bounds")
}

fn run(instructions: &[Instruction]) -> (Engine, RunReport) {
    let mut engine = Engine::new(EngineConfig::default());
    let report = engine.run(&program(instructions), &mut NullHost);
    (engine, report)
}

#[test]
fn add_program_halts_with_sum_on_stack() {
    let (engine, report) = run(&[
        Instruction::new(Opcode::Push, 5),
        Instruction::new(Opcode::Push, 3),
        Instruction::new(Opcode::Add, 0),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.stack().as_slice(), &[8]);
    assert_eq!(report.metrics.executed, 4);
    assert_eq!(report.metrics.max_stack_depth, 2);
    assert_eq!(engine.last_error(), None);
}

#[test]
fn unconditional_jump_skips_instructions() {
    let mut engine = Engine::new(EngineConfig::default());
    let mut recorder = TraceRecorder::new();
    let report = engine.run_with_observer(
        &program(&[
            Instruction::new(Opcode::Push, 99),
            Instruction::new(Opcode::Jmp, 3),
            Instruction::new(Opcode::Push, 42),
            Instruction::new(Opcode::Push, 23),
            Instruction::new(Opcode::Halt, 0),
        ]),
        &mut NullHost,
        &mut recorder,
    );
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.stack().as_slice(), &[99, 23]);

    // The instruction at index 2 must never execute.
    let trace = recorder.into_trace();
    let visited: Vec<usize> = trace.steps.iter().map(|step| step.pc).collect();
    assert_eq!(visited, vec![0, 1, 3, 4]);
}

#[test]
fn conditional_jump_on_empty_stack_underflows_before_deciding() {
    let (engine, report) = run(&[
        Instruction::new(Opcode::JmpTrue, 2),
        Instruction::new(Opcode::Push, 66),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::StackUnderflow,
            pc: 0
        }
    );
    assert!(engine.stack().is_empty());
    assert_eq!(engine.last_error(), Some(ErrorKind::StackUnderflow));
}

#[test]
fn conditional_jumps_follow_the_condition() {
    // JMP_TRUE taken on non-zero, JMP_FALSE taken on zero.
    let (engine, report) = run(&[
        Instruction::new(Opcode::Push, 7),
        Instruction::new(Opcode::JmpTrue, 3),
        Instruction::new(Opcode::Push, 100),
        Instruction::new(Opcode::Push, 0),
        Instruction::new(Opcode::JmpFalse, 6),
        Instruction::new(Opcode::Push, 200),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(report.outcome, Outcome::Halted);
    assert!(engine.stack().is_empty());
}

#[test]
fn global_store_load_round_trip() {
    let (engine, report) = run(&[
        Instruction::new(Opcode::Push, 1),
        Instruction::new(Opcode::StoreGlobal, 0),
        Instruction::new(Opcode::LoadGlobal, 0),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.stack().as_slice(), &[1]);
    assert_eq!(engine.memory().load_global(0), Ok(1));
    assert!(engine.memory().global_written(0));
}

#[test]
fn out_of_bounds_array_store_faults_and_preserves_state() {
    let (engine, report) = run(&[
        Instruction::new(Opcode::Push, 4),
        Instruction::new(Opcode::CreateArray, 0),
        Instruction::new(Opcode::Push, 5),
        Instruction::new(Opcode::Push, 10),
        Instruction::new(Opcode::StoreArray, 0),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::InvalidMemoryAccess,
            pc: 4
        }
    );
    // Array contents unchanged, operands still on the stack for inspection.
    assert_eq!(engine.memory().array_contents(0), Some(&[0, 0, 0, 0][..]));
    assert_eq!(engine.stack().as_slice(), &[5, 10]);
}

#[test]
fn jump_past_program_end_faults_without_moving_pc() {
    let (engine, report) = run(&[Instruction::new(Opcode::Jmp, 9)]);
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::InvalidJump,
            pc: 0
        }
    );
    assert_eq!(engine.pc(), 0);
}

#[test]
fn jump_to_last_instruction_is_valid() {
    let (_, report) = run(&[
        Instruction::new(Opcode::Jmp, 1),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(report.outcome, Outcome::Halted);
}

#[test]
fn running_past_the_end_halts_successfully() {
    let (engine, report) = run(&[Instruction::new(Opcode::Push, 12)]);
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.stack().as_slice(), &[12]);
}

#[test]
fn empty_program_faults_program_not_loaded() {
    let (engine, report) = run(&[]);
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::ProgramNotLoaded,
            pc: 0
        }
    );
    assert_eq!(engine.last_error(), Some(ErrorKind::ProgramNotLoaded));
    assert_eq!(report.metrics.executed, 0);
}

#[test]
fn last_error_is_untouched_by_a_later_successful_run() {
    let mut engine = Engine::new(EngineConfig::default());
    engine.run(&program(&[Instruction::new(Opcode::Pop, 0)]), &mut NullHost);
    assert_eq!(engine.last_error(), Some(ErrorKind::StackUnderflow));

    let report = engine.run(&program(&[Instruction::new(Opcode::Halt, 0)]), &mut NullHost);
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.last_error(), Some(ErrorKind::StackUnderflow));
}

#[test]
fn stack_overflow_at_capacity_boundary() {
    let config = EngineConfig {
        stack_capacity: 2,
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(config);
    let report = engine.run(
        &program(&[
            Instruction::new(Opcode::Push, 1),
            Instruction::new(Opcode::Push, 2),
            Instruction::new(Opcode::Push, 3),
        ]),
        &mut NullHost,
    );
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::StackOverflow,
            pc: 2
        }
    );
    // The failed push left the stack unchanged.
    assert_eq!(engine.stack().as_slice(), &[1, 2]);
    assert_eq!(engine.stack().len(), engine.stack().capacity());
}

#[test]
fn engines_do_not_share_memory_contexts() {
    let (first, _) = run(&[
        Instruction::new(Opcode::Push, 41),
        Instruction::new(Opcode::StoreGlobal, 3),
        Instruction::new(Opcode::Halt, 0),
    ]);
    let second = Engine::new(EngineConfig::default());
    assert_eq!(first.memory().load_global(3), Ok(41));
    assert_eq!(second.memory().load_global(3), Ok(0));
    assert!(!second.memory().global_written(3));
}

#[test]
fn cancellation_before_start_executes_nothing() {
    let mut engine = Engine::new(EngineConfig::default());
    engine.cancel_token().cancel();
    let report = engine.run(
        &program(&[Instruction::new(Opcode::Push, 1)]),
        &mut NullHost,
    );
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.metrics.executed, 0);
    assert!(engine.stack().is_empty());
    assert_eq!(engine.last_error(), None);
}

/// Raises the cancellation signal after a fixed number of dispatches, the
/// deterministic stand-in for an operator pressing the recovery button.
struct CancelAfter {
    token: CancelToken,
    remaining: u64,
    finish: Option<FinishEvent>,
}

impl Observer for CancelAfter {
    fn instruction_executed(&mut self, _event: &StepEvent) {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.token.cancel();
            }
        }
    }

    fn program_finished(&mut self, event: &FinishEvent) {
        self.finish = Some(*event);
    }
}

#[test]
fn cancellation_mid_program_preserves_machine_state() {
    let mut engine = Engine::new(EngineConfig::default());
    let mut observer = CancelAfter {
        token: engine.cancel_token(),
        remaining: 2,
        finish: None,
    };
    let report = engine.run_with_observer(
        &program(&[
            Instruction::new(Opcode::Push, 1),
            Instruction::new(Opcode::Push, 2),
            Instruction::new(Opcode::Push, 3),
            Instruction::new(Opcode::Halt, 0),
        ]),
        &mut NullHost,
        &mut observer,
    );
    // The signal was raised after the second dispatch; the loop must stop
    // before fetching the third instruction.
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.metrics.executed, 2);
    assert_eq!(engine.stack().as_slice(), &[1, 2]);
    assert_eq!(engine.last_error(), None);

    let finish = observer.finish.expect("finish event delivered");
    assert_eq!(finish.executed, 2);
    assert_eq!(finish.outcome, Outcome::Cancelled);
}

#[test]
fn observer_sees_every_dispatch_and_the_finish_event() {
    let mut engine = Engine::new(EngineConfig::default());
    let mut recorder = TraceRecorder::new();
    engine.run_with_observer(
        &program(&[
            Instruction::new(Opcode::Push, 5),
            Instruction::new(Opcode::Push, 3),
            Instruction::new(Opcode::Add, 0),
            Instruction::new(Opcode::Halt, 0),
        ]),
        &mut NullHost,
        &mut recorder,
    );
    let trace = recorder.into_trace();
    assert_eq!(trace.executed, 4);
    assert_eq!(trace.outcome, Some(Outcome::Halted));
    assert_eq!(trace.steps.len(), 4);
    assert_eq!(trace.steps[0].opcode, Opcode::Push as u8);
    assert_eq!(trace.steps[0].immediate, 5);
    assert_eq!(trace.steps[3].opcode, Opcode::Halt as u8);
}

#[test]
fn fault_location_is_reported_in_the_outcome() {
    let (_, report) = run(&[
        Instruction::new(Opcode::Push, 1),
        Instruction::new(Opcode::Push, 0),
        Instruction::new(Opcode::Div, 0),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(
        report.outcome,
        Outcome::Faulted {
            kind: ErrorKind::DivisionByZero,
            pc: 2
        }
    );
}

#[test]
fn backward_jump_builds_a_loop() {
    // Sum 3 + 2 + 1 by looping on a counter global.
    let (engine, report) = run(&[
        Instruction::new(Opcode::Push, 3),
        Instruction::new(Opcode::StoreGlobal, 0),
        Instruction::new(Opcode::Push, 0),
        Instruction::new(Opcode::StoreGlobal, 1),
        // loop body: acc += counter; counter -= 1
        Instruction::new(Opcode::LoadGlobal, 1),
        Instruction::new(Opcode::LoadGlobal, 0),
        Instruction::new(Opcode::Add, 0),
        Instruction::new(Opcode::StoreGlobal, 1),
        Instruction::new(Opcode::LoadGlobal, 0),
        Instruction::new(Opcode::Dec, 0),
        Instruction::new(Opcode::StoreGlobal, 0),
        Instruction::new(Opcode::LoadGlobal, 0),
        Instruction::new(Opcode::JmpTrue, 4),
        Instruction::new(Opcode::LoadGlobal, 1),
        Instruction::new(Opcode::Halt, 0),
    ]);
    assert_eq!(report.outcome, Outcome::Halted);
    assert_eq!(engine.stack().as_slice(), &[6]);
}
