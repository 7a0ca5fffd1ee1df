//! Instruction prompts for the HeartGPT smoke tests.
//!
//! A prompt is the fixed categorisation preamble followed by one description
//! block per food item. [`instruction_prompt`] wraps any prompt in the Llama-2
//! chat delimiters before it is handed to the generator.

use std::fmt::Write as _;

/// Opening delimiter of a Llama-2 instruction turn.
pub const INST_OPEN: &str = "<s>[INST] ";
/// Closing delimiter of a Llama-2 instruction turn.
pub const INST_CLOSE: &str = " [/INST]";

/// Categorisation instructions shared by every food query.
pub const SYSTEM_PREAMBLE: &str = "You will be provided with food queries. \
You need to categorize the given food description to either of the options: \
Heart-healthy, Heart-unhealthy and Ambivalent. \
You will also give score to the food out of 5. 1 being unhealthiest and 5 being healthiest. \
You will use principles from the American Heart Association for healthy diets \
to categorize and score the given food description. \
The principles are: Balance energy for a healthy weight. \
Prioritize fruits, vegetables, and variety. \
Choose whole grains over refined. \
Opt for healthy protein: plant-based, fish, low-fat dairy, lean meats. \
Use liquid plant oils, avoid tropical oils, animal fats. \
Prefer minimally processed over ultra-processed foods. \
Limit added sugars in beverages and food. \
Opt for low or no salt in food choices. \
Avoid alcohol or limit intake if chosen. \
All your responses must be one category. \
You will also give score out of 5. 1 being unhealthiest and 5 being healthiest.";

/// Free-form sanity prompt run after the food queries.
pub const CHECK_PROMPT: &str = "what is an apple####";

/// Wrap `prompt` in the instruction template.
///
/// The prompt is embedded byte-for-byte; surrounding and internal whitespace
/// is preserved.
///
/// ```rust
/// use heartgpt_rs::prompt::instruction_prompt;
///
/// assert_eq!(instruction_prompt("hi  there"), "<s>[INST] hi  there [/INST]");
/// ```
#[must_use]
pub fn instruction_prompt(prompt: &str) -> String {
    let mut out = String::with_capacity(INST_OPEN.len() + prompt.len() + INST_CLOSE.len());
    out.push_str(INST_OPEN);
    out.push_str(prompt);
    out.push_str(INST_CLOSE);
    out
}

/// One food item as described in the WWEIA food tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FoodItem {
    /// Main food description.
    pub name: String,
    /// Eight-digit food code.
    pub code: u32,
    /// WWEIA category description.
    pub category: String,
    /// Ingredient description.
    pub ingredient: String,
    /// Portion weight in grams.
    pub weight_grams: f64,
}

impl FoodItem {
    /// Create a food item.
    pub fn new(
        name: impl Into<String>,
        code: u32,
        category: impl Into<String>,
        ingredient: impl Into<String>,
        weight_grams: f64,
    ) -> Self {
        Self {
            name: name.into(),
            code,
            category: category.into(),
            ingredient: ingredient.into(),
            weight_grams,
        }
    }
}

/// A categorisation request for one or more food items.
#[derive(Debug, Clone, PartialEq)]
pub struct FoodQuery {
    /// Items to categorise, in order.
    pub items: Vec<FoodItem>,
}

impl FoodQuery {
    /// Query for a single item.
    #[must_use]
    pub fn single(item: FoodItem) -> Self {
        Self { items: vec![item] }
    }

    /// Render the prompt text (without the instruction delimiters).
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from(SYSTEM_PREAMBLE);
        let numbered = self.items.len() > 1;
        for (idx, item) in self.items.iter().enumerate() {
            out.push('\n');
            out.push_str("####");
            if numbered {
                let _ = write!(out, "Food {}: ", idx + 1);
            }
            out.push_str("Categorize and give score to this description of food.\n");
            let _ = writeln!(out, "Main food description:{}", item.name);
            let _ = writeln!(out, "Food Code:{}", item.code);
            let _ = writeln!(out, "WWEIA Category description:{}", item.category);
            let _ = writeln!(out, "Ingredient description:{}", item.ingredient);
            let _ = write!(out, "Weight of the food:{} grams. ####", item.weight_grams);
        }
        out
    }
}

/// The food queries used to eyeball the fine-tuned model.
#[must_use]
pub fn heartgpt_food_queries() -> Vec<FoodQuery> {
    vec![
        FoodQuery::single(FoodItem::new(
            "Buckwheat groats",
            56_200_510,
            "Pasta, noodles, cooked grains",
            "Buckwheat groats, roasted, cooked",
            198.0,
        )),
        FoodQuery::single(FoodItem::new(
            "Fried pork chunks, Puerto Rican style",
            22_402_510,
            "Pork",
            "Pork, fresh, loin, top loin (chops), boneless, separable lean and fat, raw",
            680.4,
        )),
        FoodQuery::single(FoodItem::new(
            "Chicken breast, baked, coated, skin / coating eaten",
            24_123_120,
            "Chicken, whole pieces",
            "Chicken breast, baked, broiled, or roasted, skin eaten, from raw",
            88.0,
        )),
        FoodQuery {
            items: vec![
                FoodItem::new(
                    "Beef, rice, and vegetables including carrots, broccoli, and/or dark-green leafy; gravy",
                    27_315_410,
                    "Meat mixed dishes",
                    "Rice, white, long-grain, regular, enriched, cooked",
                    50.0,
                ),
                FoodItem::new(
                    "Swedish meatballs with cream or white sauce",
                    27_113_300,
                    "Meat mixed dishes",
                    "Beverages, water, tap, drinking",
                    177.75,
                ),
            ],
        },
        FoodQuery {
            items: vec![
                FoodItem::new(
                    "Pork chop stewed with vegetables, Puerto Rican style",
                    27_422_010,
                    "Meat mixed dishes",
                    "Tomatoes, red, ripe, canned, packed in tomato juice",
                    793.8,
                ),
                FoodItem::new(
                    "Pasta, whole grain, with cream sauce and poultry, restaurant",
                    58_146_721,
                    "Pasta mixed dishes, excludes macaroni and cheese",
                    "Salt, table, iodized",
                    2.5,
                ),
            ],
        },
    ]
}

/// All smoke-test prompts: the rendered food queries, then the sanity check.
#[must_use]
pub fn heartgpt_queries() -> Vec<String> {
    heartgpt_food_queries()
        .iter()
        .map(FoodQuery::render)
        .chain(std::iter::once(CHECK_PROMPT.to_string()))
        .collect()
}
