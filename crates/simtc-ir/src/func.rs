//! Functions: value and instruction arenas plus the top-level region.

use std::collections::HashMap;

use crate::arena::{Arena, Handle};
use crate::inst::{ConstValue, Inst, Op};
use crate::location::Location;
use crate::region::{Region, RegionKind, RegionRef};
use crate::types::Type;
use crate::value::{Use, Value, ValueDef};

/// Substitution map from original to replacement values, built while cloning.
pub type ValueMap = HashMap<Handle<Value>, Handle<Value>>;

/// An IR function (kernel).
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    /// Formal parameters, in declaration order.
    pub params: Vec<Handle<Value>>,
    /// The function body.
    pub body: Region,
    /// Subgroup size; `0` until chosen by the user or the advisor.
    pub subgroup_size: u32,
    /// Work-group size `[x, y]`; `[0, 0]` until chosen by the user or the advisor.
    pub work_group_size: [u32; 2],
    /// High-water mark of the work-group scratch buffer in bytes.
    pub scratch_size: i64,
    pub loc: Option<Location>,
    values: Arena<Value>,
    insts: Arena<Inst>,
}

impl Function {
    /// Creates an empty function with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            body: Region::new(RegionKind::Collective),
            subgroup_size: 0,
            work_group_size: [0, 0],
            scratch_size: 0,
            loc: None,
            values: Arena::new(),
            insts: Arena::new(),
        }
    }

    /// Appends a parameter of type `ty`.
    pub fn add_param(&mut self, ty: Handle<Type>, name: impl Into<String>) -> Handle<Value> {
        let mut value = Value::new(ty, None);
        value.name = Some(name.into());
        value.def = ValueDef::Param(self.params.len() as u32);
        let handle = self.values.append(value);
        self.params.push(handle);
        handle
    }

    /// Creates a detached value.
    pub fn new_value(&mut self, ty: Handle<Type>, loc: Option<Location>) -> Handle<Value> {
        self.values.append(Value::new(ty, loc))
    }

    pub fn value(&self, value: Handle<Value>) -> &Value {
        &self.values[value]
    }

    pub fn value_mut(&mut self, value: Handle<Value>) -> &mut Value {
        &mut self.values[value]
    }

    pub fn value_type(&self, value: Handle<Value>) -> Handle<Type> {
        self.values[value].ty
    }

    pub fn inst(&self, inst: Handle<Inst>) -> &Inst {
        &self.insts[inst]
    }

    pub fn inst_mut(&mut self, inst: Handle<Inst>) -> &mut Inst {
        &mut self.insts[inst]
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn inst_count(&self) -> usize {
        self.insts.len()
    }

    /// Creates an instruction, its result values, and registers operand uses.
    ///
    /// The instruction is not inserted into any region.
    pub fn create_inst(
        &mut self,
        op: Op,
        operands: Vec<Handle<Value>>,
        result_types: &[Handle<Type>],
        regions: Vec<Region>,
        loc: Option<Location>,
    ) -> Handle<Inst> {
        let inst = self.insts.append(Inst {
            op,
            operands: Vec::new(),
            results: Vec::new(),
            regions,
            loc,
        });
        let results = result_types
            .iter()
            .enumerate()
            .map(|(index, &ty)| {
                let mut value = Value::new(ty, loc);
                value.def = ValueDef::Result {
                    inst,
                    index: index as u32,
                };
                self.values.append(value)
            })
            .collect();
        for (operand, &value) in operands.iter().enumerate() {
            self.values[value].uses.push(Use {
                inst,
                operand: operand as u32,
            });
        }
        let params: Vec<_> = self.insts[inst]
            .regions
            .iter()
            .enumerate()
            .flat_map(|(r, region)| {
                region
                    .params
                    .iter()
                    .enumerate()
                    .map(move |(i, &p)| (r as u32, i as u32, p))
            })
            .collect();
        for (region, index, param) in params {
            self.values[param].def = ValueDef::RegionParam {
                inst,
                region,
                index,
            };
        }
        let node = &mut self.insts[inst];
        node.operands = operands;
        node.results = results;
        inst
    }

    /// Replaces operand `index` of `inst` by `value`, updating use-lists.
    pub fn set_operand(&mut self, inst: Handle<Inst>, index: usize, value: Handle<Value>) {
        let old = self.insts[inst].operands[index];
        if old == value {
            return;
        }
        let slot = Use {
            inst,
            operand: index as u32,
        };
        self.values[old].uses.retain(|u| *u != slot);
        self.values[value].uses.push(slot);
        self.insts[inst].operands[index] = value;
    }

    /// Redirects every use of `old` to `new`.
    pub fn replace_all_uses_with(&mut self, old: Handle<Value>, new: Handle<Value>) {
        if old == new {
            return;
        }
        let uses = std::mem::take(&mut self.values[old].uses);
        for u in &uses {
            self.insts[u.inst].operands[u.operand as usize] = new;
        }
        self.values[new].uses.extend(uses);
    }

    /// Removes the uses held by `inst` and everything nested in its regions.
    pub fn drop_uses(&mut self, inst: Handle<Inst>) {
        let operands = self.insts[inst].operands.clone();
        for (index, value) in operands.into_iter().enumerate() {
            let slot = Use {
                inst,
                operand: index as u32,
            };
            self.values[value].uses.retain(|u| *u != slot);
        }
        let nested: Vec<_> = self.insts[inst]
            .regions
            .iter()
            .flat_map(|r| r.insts.iter().copied())
            .collect();
        for child in nested {
            self.drop_uses(child);
        }
    }

    /// Removes the instruction at `position` of `region` and drops its uses.
    pub fn erase(&mut self, region: RegionRef, position: usize) -> Handle<Inst> {
        let inst = self.region_mut(region).insts.remove(position);
        self.drop_uses(inst);
        inst
    }

    pub fn region(&self, region: RegionRef) -> &Region {
        match region {
            RegionRef::Body => &self.body,
            RegionRef::Child { inst, index } => &self.insts[inst].regions[index as usize],
        }
    }

    pub fn region_mut(&mut self, region: RegionRef) -> &mut Region {
        match region {
            RegionRef::Body => &mut self.body,
            RegionRef::Child { inst, index } => &mut self.insts[inst].regions[index as usize],
        }
    }

    /// The literal produced by a `constant` instruction defining `value`.
    pub fn constant_value(&self, value: Handle<Value>) -> Option<ConstValue> {
        let inst = self.values[value].defining_inst()?;
        match self.insts[inst].op {
            Op::Constant(c) => Some(c),
            _ => None,
        }
    }

    /// The opcode of the instruction defining `value`.
    pub fn defining_op(&self, value: Handle<Value>) -> Option<&Op> {
        let inst = self.values[value].defining_inst()?;
        Some(&self.insts[inst].op)
    }

    /// Every region of the function with its effective kind, children before parents.
    pub fn regions_post_order(&self) -> Vec<(RegionRef, RegionKind)> {
        let mut out = Vec::new();
        self.collect_regions(RegionRef::Body, self.body.kind, &mut out);
        out
    }

    fn collect_regions(
        &self,
        region: RegionRef,
        kind: RegionKind,
        out: &mut Vec<(RegionRef, RegionKind)>,
    ) {
        for &inst in &self.region(region).insts {
            for (index, child) in self.insts[inst].regions.iter().enumerate() {
                let child_ref = RegionRef::Child {
                    inst,
                    index: index as u32,
                };
                self.collect_regions(child_ref, child.kind.resolve(kind), out);
            }
        }
        out.push((region, kind));
    }

    /// Every instruction nested in `region`, in pre-order.
    pub fn collect_insts(&self, region: &Region) -> Vec<Handle<Inst>> {
        let mut out = Vec::new();
        let mut stack: Vec<Handle<Inst>> = region.insts.iter().rev().copied().collect();
        while let Some(inst) = stack.pop() {
            out.push(inst);
            for child in self.insts[inst].regions.iter().rev() {
                stack.extend(child.insts.iter().rev().copied());
            }
        }
        out
    }

    /// Deep-clones `src`, recording old-to-new value substitutions in `map`.
    ///
    /// Operands found in `map` are substituted; all others are kept, so values
    /// defined outside the cloned region stay shared.
    pub fn clone_region(&mut self, src: &Region, map: &mut ValueMap) -> Region {
        let params = src
            .params
            .iter()
            .map(|&p| {
                let mut value = self.values[p].clone();
                value.uses.clear();
                value.def = ValueDef::Detached;
                let np = self.values.append(value);
                map.insert(p, np);
                np
            })
            .collect();
        let insts = src
            .insts
            .iter()
            .map(|&inst| self.clone_inst(inst, map))
            .collect();
        Region {
            params,
            insts,
            kind: src.kind,
        }
    }

    /// Deep-clones a single instruction, see [`Function::clone_region`].
    pub fn clone_inst(&mut self, inst: Handle<Inst>, map: &mut ValueMap) -> Handle<Inst> {
        let node = &self.insts[inst];
        let op = node.op.clone();
        let loc = node.loc;
        let operands: Vec<_> = node
            .operands
            .iter()
            .map(|o| map.get(o).copied().unwrap_or(*o))
            .collect();
        let old_results = node.results.clone();
        let src_regions = node.regions.clone();
        let regions = src_regions
            .iter()
            .map(|r| self.clone_region(r, map))
            .collect();
        let result_types: Vec<_> = old_results.iter().map(|&r| self.values[r].ty).collect();
        let new = self.create_inst(op, operands, &result_types, regions, loc);
        let new_results = self.insts[new].results.clone();
        for (old, new) in old_results.into_iter().zip(new_results) {
            self.values[new].name = self.values[old].name.clone();
            map.insert(old, new);
        }
        new
    }
}
