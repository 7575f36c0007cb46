//! The PVM's lexical runtime environment.
//!
//! A chain of frames, each a contiguous vector of values. Grounded
//! directly on `original_source/libpoke/pvm.h`'s environment-chain
//! design, since a concatenative language has no nested lexical frames to
//! generalize from. Frames are heap-allocated (`Rc<RefCell<Frame>>`)
//! rather than stack-allocated, because a closure must be able to keep
//! its defining frame alive after the call that created it returns.

use crate::value::PvmValue;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct Frame {
    pub slots: Vec<PvmValue>,
    pub parent: Option<Rc<RefCell<Frame>>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("cannot pop the top-level frame")]
    PoppedToplevel,
    #[error("lexical address out of bounds: back={back} over={over}")]
    OutOfBounds { back: u32, over: u32 },
}

/// A chain of lexical frames, rooted at a permanent top-level frame.
#[derive(Debug)]
pub struct Environment {
    top: Rc<RefCell<Frame>>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    pub fn new() -> Self {
        Environment {
            top: Rc::new(RefCell::new(Frame::default())),
        }
    }

    /// Pushes a new frame; `hint` is an optional slot-count hint, used only
    /// to pre-size the backing `Vec`.
    pub fn push_frame(&mut self, hint: usize) {
        let frame = Rc::new(RefCell::new(Frame {
            slots: Vec::with_capacity(hint),
            parent: Some(self.top.clone()),
        }));
        self.top = frame;
    }

    pub fn pop_frame(&mut self) -> Result<(), EnvError> {
        let parent = self.top.borrow().parent.clone();
        match parent {
            Some(p) => {
                self.top = p;
                Ok(())
            }
            None => Err(EnvError::PoppedToplevel),
        }
    }

    pub fn register(&mut self, val: PvmValue) {
        self.top.borrow_mut().slots.push(val);
    }

    fn frame_at(&self, back: u32) -> Option<Rc<RefCell<Frame>>> {
        let mut cur = self.top.clone();
        for _ in 0..back {
            let parent = cur.borrow().parent.clone()?;
            cur = parent;
        }
        Some(cur)
    }

    pub fn lookup(&self, back: u32, over: u32) -> Result<PvmValue, EnvError> {
        let frame = self
            .frame_at(back)
            .ok_or(EnvError::OutOfBounds { back, over })?;
        let frame = frame.borrow();
        frame
            .slots
            .get(over as usize)
            .cloned()
            .ok_or(EnvError::OutOfBounds { back, over })
    }

    pub fn set(&mut self, back: u32, over: u32, val: PvmValue) -> Result<(), EnvError> {
        let frame = self
            .frame_at(back)
            .ok_or(EnvError::OutOfBounds { back, over })?;
        let mut frame = frame.borrow_mut();
        let slot = frame
            .slots
            .get_mut(over as usize)
            .ok_or(EnvError::OutOfBounds { back, over })?;
        *slot = val;
        Ok(())
    }

    pub fn toplevel_p(&self) -> bool {
        self.top.borrow().parent.is_none()
    }

    /// A handle to the current top frame, suitable for a closure to capture.
    pub fn current_frame(&self) -> Rc<RefCell<Frame>> {
        self.top.clone()
    }

    /// The outermost (global) frame, reached by walking `parent` links from
    /// the current frame. Used as the lexical parent for a closure that
    /// captured no environment (a plain top-level function).
    pub fn root_frame(&self) -> Rc<RefCell<Frame>> {
        let mut cur = self.top.clone();
        loop {
            let parent = cur.borrow().parent.clone();
            match parent {
                Some(p) => cur = p,
                None => return cur,
            }
        }
    }

    /// Replace the current frame chain (used when entering a closure call:
    /// its captured environment becomes current for the call's duration).
    pub fn enter(&mut self, frame: Rc<RefCell<Frame>>) -> Rc<RefCell<Frame>> {
        std::mem::replace(&mut self.top, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_same_frame() {
        let mut env = Environment::new();
        env.register(PvmValue::make_uint(42, 32).unwrap());
        let v = env.lookup(0, 0).unwrap();
        assert!(v.equal_p(&PvmValue::make_uint(42, 32).unwrap()));
    }

    #[test]
    fn lookup_walks_back_frames() {
        let mut env = Environment::new();
        env.register(PvmValue::make_uint(1, 32).unwrap());
        env.push_frame(4);
        env.register(PvmValue::make_uint(2, 32).unwrap());
        assert!(env.lookup(0, 0).unwrap().equal_p(&PvmValue::make_uint(2, 32).unwrap()));
        assert!(env.lookup(1, 0).unwrap().equal_p(&PvmValue::make_uint(1, 32).unwrap()));
    }

    #[test]
    fn set_mutates_in_place() {
        let mut env = Environment::new();
        env.register(PvmValue::make_uint(1, 32).unwrap());
        env.set(0, 0, PvmValue::make_uint(99, 32).unwrap()).unwrap();
        assert!(env.lookup(0, 0).unwrap().equal_p(&PvmValue::make_uint(99, 32).unwrap()));
    }

    #[test]
    fn popping_toplevel_is_an_error() {
        let mut env = Environment::new();
        assert_eq!(env.pop_frame().unwrap_err(), EnvError::PoppedToplevel);
    }

    #[test]
    fn root_frame_is_stable_across_pushes() {
        let mut env = Environment::new();
        let root = env.root_frame();
        env.push_frame(1);
        env.push_frame(1);
        assert!(Rc::ptr_eq(&root, &env.root_frame()));
    }

    #[test]
    fn out_of_bounds_lookup_errors() {
        let env = Environment::new();
        assert!(matches!(
            env.lookup(5, 0),
            Err(EnvError::OutOfBounds { .. })
        ));
    }
}
