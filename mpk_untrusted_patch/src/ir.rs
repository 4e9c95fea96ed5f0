//! A compact module IR for the post-instrumentation pass.
//!
//! Functions hold basic blocks; blocks hold instructions and their
//! successor edges; call instructions carry a callee symbol and operands.
//! An instruction may define a numeric value that later operands reference,
//! which is how a hook call points back at the allocator call it guards.
//! The whole module round-trips through JSON so a patched module can be
//! diffed byte-for-byte against a second run.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub functions: Vec<Function>,
}

impl Module {
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.function(name).is_some()
    }

    /// Appends an extern declaration for `name`.
    pub fn declare_function(&mut self, name: &str) {
        self.functions.push(Function::declaration(name));
    }

    pub fn remove_function(&mut self, name: &str) {
        self.functions.retain(|f| f.name != name);
    }
}

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnFlags {
    /// The function is an allocator shim (the attribute the rewrite pass
    /// re-inlines).
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub allocator: bool,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub never_inline: bool,
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub always_inline: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    /// Empty for declarations. Block 0 is the entry block.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub flags: FnFlags,
}

impl Function {
    pub fn new(name: &str, blocks: Vec<Block>) -> Self {
        Self {
            name: name.to_owned(),
            blocks,
            flags: FnFlags::default(),
        }
    }

    pub fn declaration(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The block's printable name: its own, or `block<index>` when unnamed.
    pub fn block_name(&self, index: usize) -> String {
        match &self.blocks[index].name {
            Some(name) => name.clone(),
            None => format!("block{index}"),
        }
    }

    /// Reachable blocks in reverse post-order over the successor edges.
    pub fn reverse_post_order(&self) -> Vec<usize> {
        if self.blocks.is_empty() {
            return Vec::new();
        }
        let mut post = Vec::with_capacity(self.blocks.len());
        let mut seen = vec![false; self.blocks.len()];
        // (block, index of the next successor edge to follow)
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        seen[0] = true;
        while let Some((block, cursor)) = stack.pop() {
            if let Some(&succ) = self.blocks[block].succs.get(cursor) {
                stack.push((block, cursor + 1));
                if succ < self.blocks.len() && !seen[succ] {
                    seen[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
            }
        }
        post.reverse();
        post
    }

    /// Where each value is defined, as `value -> (block, instruction)`.
    pub fn value_defs(&self) -> HashMap<u32, (usize, usize)> {
        let mut defs = HashMap::new();
        for (bi, block) in self.blocks.iter().enumerate() {
            for (ii, inst) in block.insts.iter().enumerate() {
                if let Some(value) = inst.result {
                    defs.insert(value, (bi, ii));
                }
            }
        }
        defs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub insts: Vec<Inst>,
    /// Indices of successor blocks within the function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub succs: Vec<usize>,
}

impl Block {
    pub fn new(insts: Vec<Inst>, succs: Vec<usize>) -> Self {
        Self {
            name: None,
            insts,
            succs,
        }
    }

    pub fn named(name: &str, insts: Vec<Inst>, succs: Vec<usize>) -> Self {
        Self {
            name: Some(name.to_owned()),
            insts,
            succs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inst {
    /// The value this instruction defines, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<u32>,
    pub op: Op,
}

impl Inst {
    pub fn call(result: Option<u32>, callee: &str, args: Vec<Operand>) -> Self {
        Self {
            result,
            op: Op::Call {
                callee: callee.to_owned(),
                args,
            },
        }
    }

    pub fn opaque(mnemonic: &str) -> Self {
        Self {
            result: None,
            op: Op::Opaque(mnemonic.to_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Call { callee: String, args: Vec<Operand> },
    /// Anything the pass does not interpret.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Reference to the value another instruction defines.
    Value(u32),
    Imm(i64),
    Str(String),
    /// A slot the instrumentation left for the patcher to fill.
    Undef,
}

#[cfg(test)]
mod tests {
    use super::{Block, Function, Inst, Module, Operand};

    #[test]
    fn rpo_of_a_diamond_visits_join_last() {
        //    0
        //   / \
        //  1   2
        //   \ /
        //    3
        let func = Function::new(
            "diamond",
            vec![
                Block::new(vec![], vec![1, 2]),
                Block::new(vec![], vec![3]),
                Block::new(vec![], vec![3]),
                Block::new(vec![], vec![]),
            ],
        );
        let rpo = func.reverse_post_order();
        assert_eq!(rpo[0], 0);
        assert_eq!(rpo[3], 3);
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn rpo_skips_unreachable_blocks() {
        let func = Function::new(
            "partial",
            vec![
                Block::new(vec![], vec![1]),
                Block::new(vec![], vec![]),
                // Dangling block nothing points at.
                Block::new(vec![], vec![]),
            ],
        );
        assert_eq!(func.reverse_post_order(), vec![0, 1]);
    }

    #[test]
    fn rpo_handles_loops() {
        let func = Function::new(
            "looped",
            vec![
                Block::new(vec![], vec![1]),
                Block::new(vec![], vec![1, 2]),
                Block::new(vec![], vec![]),
            ],
        );
        assert_eq!(func.reverse_post_order(), vec![0, 1, 2]);
    }

    #[test]
    fn unnamed_blocks_are_named_by_slot() {
        let func = Function::new(
            "naming",
            vec![
                Block::named("entry", vec![], vec![1]),
                Block::new(vec![], vec![]),
            ],
        );
        assert_eq!(func.block_name(0), "entry");
        assert_eq!(func.block_name(1), "block1");
    }

    #[test]
    fn value_defs_locate_defining_instructions() {
        let func = Function::new(
            "defs",
            vec![Block::new(
                vec![
                    Inst::call(Some(1), "__rust_alloc", vec![Operand::Imm(64)]),
                    Inst::call(None, "allocHook", vec![Operand::Value(1)]),
                ],
                vec![],
            )],
        );
        let defs = func.value_defs();
        assert_eq!(defs.get(&1), Some(&(0, 0)));
        assert!(defs.get(&2).is_none());
    }

    #[test]
    fn module_json_round_trips() {
        let mut module = Module::default();
        module.functions.push(Function::new(
            "foo",
            vec![Block::new(
                vec![Inst::call(
                    Some(1),
                    "__rust_alloc",
                    vec![Operand::Imm(64), Operand::Undef, Operand::Str("s".into())],
                )],
                vec![],
            )],
        ));
        module.declare_function("allocHook");

        let text = serde_json::to_string_pretty(&module).unwrap();
        let back: Module = serde_json::from_str(&text).unwrap();
        assert_eq!(module, back);
    }
}
